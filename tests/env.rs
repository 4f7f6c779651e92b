use alloclock::{BackendKind, Config, Error, BACKEND_ENV, MULTITHREADED_ENV};

// The environment is process-wide, so every case lives in a single test.
#[test]
fn reads_configuration_from_env() {
    std::env::remove_var(BACKEND_ENV);
    std::env::remove_var(MULTITHREADED_ENV);
    assert_eq!(Config::from_env().unwrap(), Config::new());

    std::env::set_var(BACKEND_ENV, "native");
    std::env::set_var(MULTITHREADED_ENV, "1");
    let config = Config::from_env().unwrap();
    assert_eq!(config, Config::new().backend(BackendKind::Native).multithreaded(true));
    let ctx = config.build().unwrap();
    assert_eq!(ctx.backend().kind(), BackendKind::Native);
    assert!(ctx.locking_required());

    std::env::set_var(BACKEND_ENV, "ticket");
    assert_eq!(Config::from_env().unwrap_err(), Error::UnknownBackend("ticket".to_owned()));

    std::env::set_var(BACKEND_ENV, "spin");
    std::env::set_var(MULTITHREADED_ENV, "sometimes");
    let err = Config::from_env().unwrap_err();
    assert_eq!(err, Error::InvalidEnv { var: MULTITHREADED_ENV, value: "sometimes".to_owned() });
    assert!(err.to_string().contains(MULTITHREADED_ENV));

    std::env::remove_var(BACKEND_ENV);
    std::env::remove_var(MULTITHREADED_ENV);
}
