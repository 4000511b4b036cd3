use httpmock::{Method::GET, MockServer};
use reqwest::StatusCode;
use rtc_socket::session::SecretString;
use rtc_socket::validator::RestValidator;
use rtc_socket::ws::{SessionValidator as _, Validation};

const VERSION: &str = "1.2.3";

fn token() -> SecretString {
    SecretString::from("session-token".to_owned())
}

#[tokio::test]
async fn success_status_authorizes() -> anyhow::Result<()> {
    let server = MockServer::start();
    let validator = RestValidator::new(&server.base_url(), VERSION)?;

    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/")
            .query_param("action", "validateConnectionForWebsocket")
            .query_param("client", VERSION)
            .header("authorization", "Bearer session-token");
        then.status(StatusCode::OK);
    });

    let outcome = validator.validate(token()).await;

    assert_eq!(outcome, Validation::Authorized);
    mock.assert();

    Ok(())
}

#[tokio::test]
async fn unauthorized_status_is_unauthenticated() -> anyhow::Result<()> {
    let server = MockServer::start();
    let validator = RestValidator::new(&server.base_url(), VERSION)?;

    let mock = server.mock(|when, then| {
        when.method(GET).path("/");
        then.status(StatusCode::UNAUTHORIZED);
    });

    let outcome = validator.validate(token()).await;

    assert_eq!(outcome, Validation::Unauthenticated);
    mock.assert();

    Ok(())
}

#[tokio::test]
async fn other_status_is_failure_with_body() -> anyhow::Result<()> {
    let server = MockServer::start();
    let validator = RestValidator::new(&server.base_url(), VERSION)?;

    let mock = server.mock(|when, then| {
        when.method(GET).path("/");
        then.status(StatusCode::SERVICE_UNAVAILABLE)
            .body("maintenance");
    });

    let outcome = validator.validate(token()).await;

    let (status, reason) = match outcome {
        Validation::Failed { status, reason } => (status, reason),
        other => panic!("expected failure, got {other:?}"),
    };
    assert_eq!(status, Some(StatusCode::SERVICE_UNAVAILABLE));
    assert!(reason.contains("maintenance"), "{reason}");
    mock.assert();

    Ok(())
}

#[tokio::test]
async fn unreachable_service_is_failure_without_status() -> anyhow::Result<()> {
    let validator = RestValidator::new("http://127.0.0.1:1", VERSION)?;

    let outcome = validator.validate(token()).await;

    assert!(
        matches!(outcome, Validation::Failed { status: None, .. }),
        "unexpected outcome {outcome:?}"
    );

    Ok(())
}
