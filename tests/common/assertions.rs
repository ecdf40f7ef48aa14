//! Custom assertion macros for sync scenarios
//!
//! Provide descriptive failures for engine results, signals and the
//! message log.

/// Assert that a result is ok and return the value
#[macro_export]
macro_rules! assert_ok {
    ($result:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("Expected Ok, got Err: {:?}", e),
        }
    };
    ($result:expr, $message:expr) => {
        match $result {
            Ok(value) => value,
            Err(e) => panic!("{}: {:?}", $message, e),
        }
    };
}

/// Assert that a result is an error matching a pattern
#[macro_export]
macro_rules! assert_err {
    ($result:expr) => {
        assert!($result.is_err(), "Expected Err, got Ok");
    };
    ($result:expr, $pattern:pat) => {
        match $result {
            Err($pattern) => {}
            Ok(value) => panic!("Expected Err, got Ok: {:?}", value),
            Err(e) => panic!("Expected different error variant, got: {:?}", e),
        }
    };
}

/// Assert that a list of signals holds one matching a pattern
#[macro_export]
macro_rules! assert_signal {
    ($signals:expr, $pattern:pat) => {
        assert!(
            $signals.iter().any(|signal| matches!(signal, $pattern)),
            "Expected a signal matching {}, got {:?}",
            stringify!($pattern),
            $signals
        );
    };
}

/// Assert the bodies of a conversation's message log, in display order
#[macro_export]
macro_rules! assert_bodies {
    ($state:expr, [$($body:expr),* $(,)?]) => {
        let bodies: Vec<&str> = $state.messages().iter().map(|entry| entry.message.body()).collect();
        let expected: Vec<&str> = vec![$($body),*];
        pretty_assertions::assert_eq!(bodies, expected);
    };
}
