//! `.mcp.json` generation so Claude Code discovers the control plane.

use std::path::{Path, PathBuf};

use crate::error::Result;

pub fn generate_mcp_config(project_dir: &Path) -> serde_json::Value {
    serde_json::json!({
        "mcpServers": {
            "tc": {
                "command": "tc",
                "args": ["mcp", "--project-dir", project_dir.display().to_string()],
            }
        }
    })
}

pub fn write_mcp_config(project_dir: &Path) -> Result<PathBuf> {
    let config = generate_mcp_config(project_dir);
    let path = project_dir.join(".mcp.json");
    std::fs::write(&path, format!("{}\n", serde_json::to_string_pretty(&config)?))?;
    Ok(path)
}
