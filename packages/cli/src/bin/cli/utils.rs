// ABOUTME: Argument parsing helpers shared by CLI commands
// ABOUTME: Parses KEY=VALUE environment pairs and maps run outcomes to exit codes

use corral_sandbox::RunOutcome;

/// Exit code reported when a run was interrupted
pub const ABORTED_EXIT_CODE: i32 = 130;

/// Parse a `KEY=VALUE` pair passed with `-e`
pub fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", raw))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing variable name in {:?}", raw));
    }
    if key.chars().any(|c| c.is_whitespace()) {
        return Err(format!("variable name {:?} contains whitespace", key));
    }
    Ok((key.to_string(), value.to_string()))
}

pub fn exit_code(outcome: &RunOutcome) -> i32 {
    if outcome.aborted {
        return ABORTED_EXIT_CODE;
    }
    if outcome.exited_cleanly {
        return 0;
    }
    outcome
        .exit_code
        .and_then(|code| i32::try_from(code).ok())
        .filter(|code| *code != 0)
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case("FOO=bar", ("FOO", "bar"))]
    #[case("URL=http://x?a=b", ("URL", "http://x?a=b"))]
    #[case("EMPTY=", ("EMPTY", ""))]
    fn test_parse_env_pair(#[case] raw: &str, #[case] expected: (&str, &str)) {
        let (key, value) = parse_env_pair(raw).unwrap();
        assert_eq!((key.as_str(), value.as_str()), expected);
    }

    #[rstest]
    #[case("NOVALUE")]
    #[case("=value")]
    #[case("BAD KEY=1")]
    fn test_parse_env_pair_rejects(#[case] raw: &str) {
        assert!(parse_env_pair(raw).is_err());
    }

    fn outcome(exit_code: Option<i64>, exited_cleanly: bool, aborted: bool) -> RunOutcome {
        RunOutcome {
            session_id: "s1".to_string(),
            output: String::new(),
            stderr: String::new(),
            exit_code,
            exited_cleanly,
            aborted,
        }
    }

    #[rstest]
    #[case(outcome(Some(0), true, false), 0)]
    #[case(outcome(None, true, false), 0)]
    #[case(outcome(Some(2), false, false), 2)]
    #[case(outcome(Some(i64::MAX), false, false), 1)]
    #[case(outcome(None, false, true), ABORTED_EXIT_CODE)]
    fn test_exit_code(#[case] outcome: RunOutcome, #[case] expected: i32) {
        assert_eq!(exit_code(&outcome), expected);
    }
}
