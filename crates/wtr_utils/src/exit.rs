/// Exit code to issue if the harness itself fails, rather than any test.
pub const CODE_HARNESS_ERROR: i32 = 2;

/// The overall outcome of a test run, as a process exit code.
#[derive(PartialEq, Eq, Debug, Clone, Copy, PartialOrd, Ord)]
pub struct ExitCode(i32);

impl ExitCode {
    /// Every test ran and every result matched its expectation.
    pub const SUCCESS: ExitCode = ExitCode(0);
    /// Some test produced an unexpected result.
    pub const UNEXPECTED: ExitCode = ExitCode(1);
    /// A worker exhausted its restarts, or a manager died.
    pub const HARNESS_ERROR: ExitCode = ExitCode(CODE_HARNESS_ERROR);

    pub const fn get(&self) -> i32 {
        self.0
    }

    pub const fn new(code: i32) -> Self {
        Self(code)
    }

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        // Codes are in 0..=255 by construction of the constants above; clamp anything else.
        let code = u8::try_from(code.get()).unwrap_or(u8::MAX);
        std::process::ExitCode::from(code)
    }
}

#[cfg(test)]
mod test {
    use super::ExitCode;

    #[test]
    fn harness_error_dominates() {
        let worst = [ExitCode::SUCCESS, ExitCode::HARNESS_ERROR, ExitCode::UNEXPECTED]
            .into_iter()
            .max()
            .unwrap();
        assert_eq!(worst, ExitCode::HARNESS_ERROR);
    }

    #[test]
    fn only_zero_is_success() {
        assert!(ExitCode::SUCCESS.is_success());
        assert!(!ExitCode::UNEXPECTED.is_success());
        assert!(!ExitCode::new(27).is_success());
    }
}
