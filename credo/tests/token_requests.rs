mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use credo::{
    login::{LoginError, LoginTransport, RawAuthResult},
    AudienceKey, AudienceKeyRef, AuthError, AuthEvent, Config, InMemoryStorage,
};
use wiremock::{
    matchers::{body_string_contains, header, method, path},
    Mock, ResponseTemplate,
};

use common::Authority;

#[tokio::test]
async fn concurrent_requests_share_one_refresh() -> color_eyre::Result<()> {
    let authority = Authority::start().await;
    let storage = Arc::new(InMemoryStorage::new());
    common::seed(&storage, &authority.main_record(30, 3_600, false)).await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(authority.session_response(false))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&authority.server)
        .await;

    let (auth, mut pump) = common::authenticator(authority.raw_config(), &storage);
    auth.initialize().await?;

    let results = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..5 {
        let sink = Arc::clone(&results);
        auth.request_token(AudienceKey::main(), false, move |result| {
            sink.lock().unwrap().push(result)
        });
    }

    common::pump_until(&mut pump, || results.lock().unwrap().len() == 5).await;

    let results = results.lock().unwrap();
    let first = results[0].as_ref().expect("refresh succeeds");
    assert!(first.until_expired().0 > 60);
    for result in results.iter() {
        let record = result.as_ref().expect("refresh succeeds");
        assert_eq!(record.access_token(), first.access_token());
    }
    Ok(())
}

#[tokio::test]
async fn forced_leader_satisfies_unforced_followers() -> color_eyre::Result<()> {
    let authority = Authority::start().await;
    let storage = Arc::new(InMemoryStorage::new());
    let cached = authority.main_record(200, 3_600, false);
    common::seed(&storage, &cached).await;

    let refreshed = authority.session_response(false);
    let refreshed_access = refreshed["access_token"].as_str().unwrap_or_default().to_owned();
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(refreshed)
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&authority.server)
        .await;

    let (auth, mut pump) = common::authenticator(authority.raw_config(), &storage);
    auth.initialize().await?;

    let results = Arc::new(Mutex::new(Vec::new()));
    for force in [true, false, false, false] {
        let sink = Arc::clone(&results);
        auth.request_token(AudienceKey::main(), force, move |result| {
            sink.lock().unwrap().push(result)
        });
    }

    common::pump_until(&mut pump, || results.lock().unwrap().len() == 4).await;

    for result in results.lock().unwrap().iter() {
        let record = result.as_ref().expect("refresh succeeds");
        assert_eq!(record.access_token().as_str(), refreshed_access);
        assert_ne!(record.access_token(), cached.access_token());
    }
    Ok(())
}

#[tokio::test]
async fn fresh_session_is_served_from_cache() -> color_eyre::Result<()> {
    let authority = Authority::start().await;
    let storage = Arc::new(InMemoryStorage::new());
    let cached = authority.main_record(300, 3_600, false);
    common::seed(&storage, &cached).await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&authority.server)
        .await;

    let (auth, _pump) = common::authenticator(authority.raw_config(), &storage);
    auth.initialize().await?;

    let record = auth.token(AudienceKey::main(), false).await?;
    assert_eq!(record, cached);
    assert!(!auth.needs_authentication().await?);
    Ok(())
}

#[tokio::test]
async fn audiences_are_resolved_independently() -> color_eyre::Result<()> {
    let authority = Authority::start().await;
    let storage = Arc::new(InMemoryStorage::new());
    let main = authority.main_record(300, 3_600, false);
    common::seed(&storage, &main).await;

    for audience in ["billing", "inventory"] {
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains(format!("audience={}", audience)))
            .and(header(
                "authorization",
                format!("Bearer {}", main.access_token().as_str()).as_str(),
            ))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(authority.audience_response(audience)),
            )
            .expect(1)
            .mount(&authority.server)
            .await;
    }

    let (auth, _pump) = common::authenticator(authority.raw_config(), &storage);
    auth.initialize().await?;

    let (billing, inventory) = tokio::join!(
        auth.token(AudienceKey::from_static("billing"), false),
        auth.token(AudienceKey::from_static("inventory"), false),
    );
    let billing = billing?;
    let inventory = inventory?;

    assert_eq!(billing.audience().as_str(), "billing");
    assert_eq!(inventory.audience().as_str(), "inventory");
    assert_ne!(billing.access_token(), inventory.access_token());

    let again = auth.token(AudienceKey::from_static("billing"), false).await?;
    assert_eq!(again, billing);

    let main_again = auth.token(AudienceKey::main(), false).await?;
    assert_eq!(main_again, main);
    Ok(())
}

#[tokio::test]
async fn audience_is_not_blocked_by_main_refresh() -> color_eyre::Result<()> {
    let authority = Authority::start().await;
    let storage = Arc::new(InMemoryStorage::new());
    common::seed(&storage, &authority.main_record(10, 3_600, false)).await;
    let billing = authority.audience_record("billing", 300);
    common::seed(&storage, &billing).await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("grant_type=refresh_token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(authority.session_response(false))
                .set_delay(Duration::from_secs(1)),
        )
        .expect(1)
        .mount(&authority.server)
        .await;

    let (auth, mut pump) = common::authenticator(authority.raw_config(), &storage);
    auth.initialize().await?;

    let main = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&main);
    auth.request_token(AudienceKey::main(), false, move |result| {
        *sink.lock().unwrap() = Some(result)
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let cached = tokio::time::timeout(
        Duration::from_millis(500),
        auth.token(AudienceKey::from_static("billing"), false),
    )
    .await??;
    assert_eq!(cached, billing);

    pump.drain();
    assert!(main.lock().unwrap().is_none());

    common::pump_until(&mut pump, || main.lock().unwrap().is_some()).await;
    let refreshed = main.lock().unwrap().take().expect("main request completed")?;
    assert_eq!(refreshed.audience(), AudienceKeyRef::main());
    Ok(())
}

#[derive(Debug, Default)]
struct CrashingLogin {
    response: Option<serde_json::Value>,
    calls: AtomicUsize,
}

#[async_trait]
impl LoginTransport for CrashingLogin {
    async fn start_login(&self, _config: &Config) -> Result<RawAuthResult, LoginError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("login transport crashed");
        }
        let response = self.response.clone().unwrap_or_default();
        serde_json::from_value(response).map_err(|e| LoginError::Failed(e.to_string()))
    }
}

#[tokio::test]
async fn crashed_request_releases_its_waiters() -> color_eyre::Result<()> {
    let authority = Authority::start().await;
    let storage = Arc::new(InMemoryStorage::new());
    let login = Arc::new(CrashingLogin {
        response: Some(authority.session_response(false)),
        ..CrashingLogin::default()
    });

    let mut raw = authority.raw_config();
    raw.interactive_reauth = Some(true);
    let (auth, mut pump) =
        credo::Authenticator::builder(raw, Arc::clone(&storage), common::key_material())
            .with_login_transport(Arc::clone(&login))
            .build()?;
    let events = common::record_events(&auth);
    auth.initialize().await?;

    let (first, second) = tokio::time::timeout(Duration::from_secs(3), async {
        tokio::join!(
            auth.token(AudienceKey::main(), false),
            auth.token(AudienceKey::main(), false),
        )
    })
    .await?;
    assert_eq!(first, Err(AuthError::Cancelled));
    assert_eq!(second, Err(AuthError::Cancelled));
    assert_eq!(login.calls.load(Ordering::SeqCst), 1);

    let record = tokio::time::timeout(
        Duration::from_secs(3),
        auth.token(AudienceKey::main(), false),
    )
    .await??;
    assert_eq!(record.audience(), AudienceKeyRef::main());
    assert_eq!(login.calls.load(Ordering::SeqCst), 2);

    pump.drain();
    assert!(events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, AuthEvent::InternalError { .. })));
    Ok(())
}

#[tokio::test]
async fn audience_request_without_session_makes_no_request() -> color_eyre::Result<()> {
    let authority = Authority::start().await;
    let storage = Arc::new(InMemoryStorage::new());

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&authority.server)
        .await;

    let (auth, _pump) = common::authenticator(authority.raw_config(), &storage);
    auth.initialize().await?;

    let err = auth
        .token(AudienceKey::from_static("billing"), false)
        .await
        .expect_err("no session is stored");
    assert_eq!(err, AuthError::NoValidCredentials);
    assert!(auth.needs_authentication().await?);
    Ok(())
}

#[tokio::test]
async fn expired_refresh_token_requires_authentication() -> color_eyre::Result<()> {
    let authority = Authority::start().await;
    let storage = Arc::new(InMemoryStorage::new());
    common::seed(&storage, &authority.main_record(-600, -300, false)).await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(500))
        .expect(0)
        .mount(&authority.server)
        .await;

    let (auth, _pump) = common::authenticator(authority.raw_config(), &storage);
    auth.initialize().await?;
    assert!(auth.needs_authentication().await?);

    let err = auth
        .token(AudienceKey::main(), false)
        .await
        .expect_err("refresh token expired");
    assert_eq!(err, AuthError::ExpiredRefreshCredentials);

    let err = auth
        .token(AudienceKey::main(), false)
        .await
        .expect_err("session was removed");
    assert_eq!(err, AuthError::NoValidCredentials);
    Ok(())
}

#[tokio::test]
async fn refused_refresh_token_removes_session() -> color_eyre::Result<()> {
    let authority = Authority::start().await;
    let storage = Arc::new(InMemoryStorage::new());
    common::seed(&storage, &authority.main_record(10, 3_600, false)).await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_grant",
            "error_description": "Token is not active",
        })))
        .expect(1)
        .mount(&authority.server)
        .await;

    let (auth, _pump) = common::authenticator(authority.raw_config(), &storage);
    auth.initialize().await?;

    let err = auth
        .token(AudienceKey::main(), false)
        .await
        .expect_err("refresh token refused");
    assert_eq!(err, AuthError::ExpiredRefreshCredentials);
    assert!(common::store(&storage)
        .get(AudienceKeyRef::main())
        .await
        .is_none());
    Ok(())
}

#[tokio::test]
async fn server_errors_are_reported_to_every_waiter() -> color_eyre::Result<()> {
    let authority = Authority::start().await;
    let storage = Arc::new(InMemoryStorage::new());
    common::seed(&storage, &authority.main_record(10, 3_600, false)).await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .expect(1)
        .mount(&authority.server)
        .await;

    let (auth, mut pump) = common::authenticator(authority.raw_config(), &storage);
    let events = common::record_events(&auth);
    auth.initialize().await?;

    let results = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..3 {
        let sink = Arc::clone(&results);
        auth.request_token(AudienceKey::main(), false, move |result| {
            sink.lock().unwrap().push(result)
        });
    }
    common::pump_until(&mut pump, || results.lock().unwrap().len() == 3).await;

    for result in results.lock().unwrap().iter() {
        match result {
            Err(AuthError::NetworkError { status, body, .. }) => {
                assert_eq!(*status, Some(503));
                assert_eq!(body.as_deref(), Some("maintenance"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    let failures = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, AuthEvent::TokenRequestFailed { .. }))
        .count();
    assert_eq!(failures, 1);

    // the stored session survives a transient failure
    assert!(common::store(&storage)
        .get(AudienceKeyRef::main())
        .await
        .is_some());
    Ok(())
}

#[tokio::test]
async fn verified_email_is_announced_once() -> color_eyre::Result<()> {
    let authority = Authority::start().await;
    let storage = Arc::new(InMemoryStorage::new());
    common::seed(&storage, &authority.main_record(10, 3_600, false)).await;

    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(authority.session_response(true)))
        .mount(&authority.server)
        .await;

    let (auth, mut pump) = common::authenticator(authority.raw_config(), &storage);
    let events = common::record_events(&auth);
    auth.initialize().await?;

    assert!(!auth.is_cached_email_verified().await?);
    let record = auth.token(AudienceKey::main(), true).await?;
    assert!(record.email_verified());
    assert!(auth.is_cached_email_verified().await?);

    auth.token(AudienceKey::main(), true).await?;

    common::pump_until(&mut pump, || {
        events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, AuthEvent::TokenRequestSucceeded { .. }))
            .count()
            == 2
    })
    .await;

    let announcements = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| **e == AuthEvent::EmailVerificationSucceeded)
        .count();
    assert_eq!(announcements, 1);
    Ok(())
}
