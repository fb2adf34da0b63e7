//! `env_logger` set up for embedders and tests.

use env_logger::Env;

/// Log to stderr, filtered by `RUST_LOG` and `info` otherwise.
///
/// Safe to call more than once; only the first call installs the logger.
pub fn init() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info")).try_init();
}

/// Like [`init`], but captured by the test harness.
pub fn init_test() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[cfg(test)]
mod test {
    #[test]
    fn test_init_twice() {
        super::init_test();
        super::init();
        log::info!("logger installed");
    }
}
