use hoster::error::HosterError;

#[test]
fn display_carries_context() {
    let err = HosterError::ImageNotFound("nginx:missing".into());
    assert_eq!(err.to_string(), "image not found: nginx:missing");

    let err = HosterError::InvalidTransition {
        from: "running".into(),
        to: "pending".into(),
    };
    assert_eq!(err.to_string(), "invalid transition: running -> pending");
}

#[test]
fn wire_codes_are_kebab_case() {
    let cases = [
        (HosterError::NotFound("x".into()), "not-found"),
        (HosterError::AlreadyExists("x".into()), "already-exists"),
        (HosterError::NotRunning("x".into()), "not-running"),
        (HosterError::AlreadyRunning("x".into()), "already-running"),
        (HosterError::InUse("x".into()), "in-use"),
        (HosterError::PortConflict("x".into()), "port-conflict"),
        (HosterError::ConnectionFailed("x".into()), "connection-failed"),
        (HosterError::ImageNotFound("x".into()), "image-not-found"),
        (HosterError::ImagePullFailed("x".into()), "image-pull-failed"),
        (HosterError::Timeout("x".into()), "timeout"),
        (HosterError::LimitExceeded("x".into()), "limit-exceeded"),
        (HosterError::BadRequest("x".into()), "bad-request"),
        (HosterError::Conflict("x".into()), "conflict"),
        (HosterError::Internal("x".into()), "internal"),
    ];

    for (err, code) in cases {
        assert_eq!(err.kind(), code);
    }
}

#[test]
fn agent_codes_round_trip_through_the_envelope() {
    for code in [
        "not-found",
        "already-exists",
        "port-conflict",
        "image-not-found",
        "timeout",
        "connection-failed",
    ] {
        let rebuilt = HosterError::from_kind(code, "remote detail");
        assert_eq!(rebuilt.kind(), code);
        assert!(rebuilt.to_string().contains("remote detail"));
    }
}

#[test]
fn io_errors_fold_into_internal() {
    let err: HosterError = std::io::Error::other("disk gone").into();
    assert_eq!(err.kind(), "internal");
    assert_eq!(err.http_status(), 500);
}

#[test]
fn status_codes_match_api_contract() {
    assert_eq!(HosterError::NotFound("x".into()).http_status(), 404);
    assert_eq!(HosterError::Unauthorized.http_status(), 401);
    assert_eq!(HosterError::LimitExceeded("x".into()).http_status(), 400);
    assert_eq!(HosterError::Conflict("x".into()).http_status(), 409);
    assert_eq!(HosterError::InUse("x".into()).http_status(), 409);
    assert_eq!(HosterError::Timeout("x".into()).http_status(), 504);
    assert_eq!(HosterError::ConnectionFailed("x".into()).http_status(), 502);
}
