//! Init command - write the default configuration file

use crate::config::{Config, ConfigManager};
use crate::error::{DistError, DistResult};
use crate::ui::{self, UiContext};

/// Execute the init command
pub async fn execute(manager: &ConfigManager, force: bool) -> DistResult<()> {
    let ctx = UiContext::detect();
    let path = manager.path();

    if path.exists() && !force {
        return Err(DistError::AlreadyExists(path.to_path_buf()));
    }

    manager.save(&Config::default()).await?;
    ui::step_ok_detail(&ctx, "Wrote default configuration", &path.display().to_string());
    Ok(())
}
