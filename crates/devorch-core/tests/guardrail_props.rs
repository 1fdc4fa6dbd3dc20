//! Property tests for guardrail evaluation

use devorch_core::guardrail::{default_rules, GuardrailPolicy, Verdict};
use proptest::prelude::*;
use std::path::PathBuf;

const BLOCKED: &[&str] = &[
    "rm -rf /",
    "rm -fr //",
    "rm -r -f /",
    "rm -rf -- /",
    "rm --recursive --force /",
    "rm -R -f /.",
    "sudo rm -rf build",
    "mkfs.ext4 /dev/sdb1",
    "dd if=/dev/zero of=/dev/sda",
    "chmod -R 777 /",
    ":(){ :|:& };:",
];

const GUARDED: &[&str] = &[
    "git push --force",
    "git reset --hard",
    "drop table users",
    "kill -9 4242",
    "npm publish",
    "sudo apt update",
];

const HARMLESS: &[&str] = &["ls -la", "cargo build", "git status", "echo done", "npm test"];

fn policy() -> (GuardrailPolicy, PathBuf, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let cwd = dir.path().canonicalize().unwrap();
    let policy =
        GuardrailPolicy::new(default_rules(), &[cwd.to_string_lossy().into_owned()]).unwrap();
    (policy, cwd, dir)
}

fn vary(text: &str, upper: bool, spaces: usize) -> String {
    let text = if upper { text.to_uppercase() } else { text.to_string() };
    text.replace(' ', &" ".repeat(spaces))
}

proptest! {
    #[test]
    fn prop_block_wins_over_approval(
        block in prop::sample::select(BLOCKED),
        guarded in prop::sample::select(GUARDED),
        harmless in prop::sample::select(HARMLESS),
        block_first in any::<bool>(),
        upper in any::<bool>(),
        spaces in 1usize..4,
    ) {
        let (policy, cwd, _dir) = policy();
        let parts = if block_first {
            [harmless, block, guarded]
        } else {
            [guarded, harmless, block]
        };
        let text = vary(&parts.join(" ; "), upper, spaces);
        prop_assert!(policy.evaluate(&text, &cwd).is_blocked(), "not blocked: {}", text);
    }

    #[test]
    fn prop_guarded_needs_approval_in_any_spelling(
        guarded in prop::sample::select(GUARDED),
        harmless in prop::sample::select(HARMLESS),
        upper in any::<bool>(),
        spaces in 1usize..4,
    ) {
        let (policy, cwd, _dir) = policy();
        let text = vary(&format!("{} && {}", harmless, guarded), upper, spaces);
        let is_guarded = matches!(policy.evaluate(&text, &cwd), Verdict::NeedsApproval { .. });
        prop_assert!(is_guarded, "not guarded: {}", text);
    }

    #[test]
    fn prop_outside_allow_list_is_always_blocked(
        harmless in prop::sample::select(HARMLESS),
        sub in "[a-z]{1,8}",
    ) {
        let (policy, _cwd, _dir) = policy();
        let outside = PathBuf::from("/nonexistent-devorch-root").join(sub);
        prop_assert!(policy.evaluate(harmless, &outside).is_blocked());
    }

    #[test]
    fn prop_evaluate_never_panics(text in ".{0,200}") {
        let (policy, cwd, _dir) = policy();
        let _ = policy.evaluate(&text, &cwd);
    }
}

#[test]
fn test_harmless_commands_are_allowed() {
    let (policy, cwd, _dir) = policy();
    for text in HARMLESS {
        assert_eq!(policy.evaluate(text, &cwd), Verdict::Allowed, "{}", text);
    }
}
