//! Terminal output for run summaries
//!
//! Styled with `console` on an interactive terminal, plain tagged lines
//! (`[OK]`, `[FAIL]`) in CI logs.

mod context;
mod output;

pub use context::UiContext;
pub use output::{
    intro, key_value, outro_error, outro_success, remark, step_error_detail,
    step_ok_detail, step_warn,
};
