//! Terminal detection for summary output

use std::io::IsTerminal;

/// CI systems that set an environment marker
const CI_VARS: [&str; 6] = [
    "CI",
    "GITHUB_ACTIONS",
    "GITLAB_CI",
    "JENKINS_URL",
    "BUILDKITE",
    "TF_BUILD",
];

/// Decides between styled and plain tagged output
#[derive(Debug, Clone)]
pub struct UiContext {
    styled: bool,
}

impl UiContext {
    /// Styled output on an interactive stdout outside CI
    pub fn detect() -> Self {
        let ci = CI_VARS.iter().any(|var| std::env::var_os(var).is_some());
        Self {
            styled: std::io::stdout().is_terminal() && !ci,
        }
    }

    /// Plain output with `[OK]`/`[FAIL]` tags, for logs and tests
    pub fn plain() -> Self {
        Self { styled: false }
    }

    pub fn is_styled(&self) -> bool {
        self.styled
    }
}
