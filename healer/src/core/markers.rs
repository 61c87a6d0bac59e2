//! Parser for per-test result markers emitted by the sandbox harness.
//!
//! Each case produces exactly one stdout line:
//!
//! ```text
//! TESTRESULT <index> <PASS|FAIL> <message>
//! ```
//!
//! Lines that do not match the prefix exactly are ignored.

use std::collections::BTreeMap;

use crate::core::types::TestResult;

pub const MARKER_PREFIX: &str = "TESTRESULT ";

/// Parse one marker line. Returns `None` for anything that is not a well-formed marker.
pub fn parse_marker(line: &str) -> Option<TestResult> {
    let rest = line.trim_end_matches(['\r', '\n']).strip_prefix(MARKER_PREFIX)?;
    let mut parts = rest.splitn(3, ' ');
    let index = parts.next()?.parse::<usize>().ok()?;
    let passed = match parts.next()? {
        "PASS" => true,
        "FAIL" => false,
        _ => return None,
    };
    let message = parts.next().unwrap_or("").trim().to_string();
    Some(TestResult {
        index,
        passed,
        message,
    })
}

/// Collect markers for cases `0..case_count`, first report per index wins.
pub fn collect_markers(stdout: &str, case_count: usize) -> Vec<TestResult> {
    let mut by_index: BTreeMap<usize, TestResult> = BTreeMap::new();
    for result in stdout.lines().filter_map(parse_marker) {
        if result.index >= case_count {
            tracing::warn!(index = result.index, case_count, "marker index out of range");
            continue;
        }
        by_index.entry(result.index).or_insert(result);
    }
    by_index.into_values().collect()
}

/// Fill in a failed result for every case the harness never reported.
pub fn fill_unreported(results: Vec<TestResult>, case_count: usize, reason: &str) -> Vec<TestResult> {
    let mut by_index: BTreeMap<usize, TestResult> =
        results.into_iter().map(|r| (r.index, r)).collect();
    for index in 0..case_count {
        by_index.entry(index).or_insert_with(|| TestResult {
            index,
            passed: false,
            message: reason.to_string(),
        });
    }
    by_index.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pass_and_fail_lines() {
        let pass = parse_marker("TESTRESULT 0 PASS ok").expect("pass");
        assert!(pass.passed);
        assert_eq!(pass.message, "ok");

        let fail = parse_marker("TESTRESULT 12 FAIL expected 3 got 5\n").expect("fail");
        assert_eq!(fail.index, 12);
        assert!(!fail.passed);
        assert_eq!(fail.message, "expected 3 got 5");
    }

    #[test]
    fn message_may_be_empty() {
        let result = parse_marker("TESTRESULT 1 PASS").expect("marker");
        assert_eq!(result.message, "");
    }

    #[test]
    fn rejects_inexact_prefix_and_status() {
        assert!(parse_marker(" TESTRESULT 0 PASS ok").is_none());
        assert!(parse_marker("testresult 0 PASS ok").is_none());
        assert!(parse_marker("TESTRESULT x PASS ok").is_none());
        assert!(parse_marker("TESTRESULT 0 pass ok").is_none());
        assert!(parse_marker("TESTRESULT -1 FAIL ok").is_none());
    }

    #[test]
    fn collect_keeps_first_report_and_drops_out_of_range() {
        let stdout = "noise\nTESTRESULT 1 FAIL first\nTESTRESULT 0 PASS ok\nTESTRESULT 1 PASS second\nTESTRESULT 9 PASS stray\n";
        let results = collect_markers(stdout, 2);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].index, 0);
        assert!(!results[1].passed);
        assert_eq!(results[1].message, "first");
    }

    #[test]
    fn fill_unreported_marks_missing_cases_failed() {
        let results = fill_unreported(
            vec![TestResult {
                index: 1,
                passed: true,
                message: String::new(),
            }],
            3,
            "no result reported",
        );
        let passed: Vec<bool> = results.iter().map(|r| r.passed).collect();
        assert_eq!(passed, vec![false, true, false]);
        assert_eq!(results[2].message, "no result reported");
    }
}
