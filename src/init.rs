//! Project initialization: create the `.tc/` layout, the store, the project
//! row, and the `.mcp.json` the agent's sessions read.

use std::path::{Path, PathBuf};

use crate::config::ProjectPaths;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::mcp::write_mcp_config;
use crate::models::{CreateProjectInput, Project};

#[derive(Debug, Clone)]
pub struct InitResult {
    pub project: Project,
    pub db_path: PathBuf,
    pub prd_dest: PathBuf,
    pub bootstrap_dest: Option<PathBuf>,
}

pub fn initialize_project(
    project_dir: &Path,
    name: &str,
    prd_path: &Path,
    bootstrap_path: Option<&Path>,
) -> Result<InitResult> {
    let paths = ProjectPaths::for_root(project_dir);
    if paths.tc_dir.exists() {
        return Err(Error::Validation(format!(
            "project already initialized at {}",
            paths.tc_dir.display()
        )));
    }
    if !prd_path.exists() {
        return Err(Error::Validation(format!(
            "PRD file not found: {}",
            prd_path.display()
        )));
    }

    std::fs::create_dir_all(&paths.tc_dir)?;
    std::fs::create_dir_all(&paths.briefs_dir)?;
    std::fs::create_dir_all(&paths.logs_dir)?;
    std::fs::create_dir_all(&paths.plans_dir)?;

    let db = Database::open(&paths.db_path)?;
    db.migrate()?;

    // User inputs live at the project root under canonical names.
    let prd_dest = project_dir.join("prd.md");
    if prd_path != prd_dest {
        std::fs::copy(prd_path, &prd_dest)?;
    }
    let bootstrap_dest = match bootstrap_path {
        Some(source) => {
            if !source.exists() {
                return Err(Error::Validation(format!(
                    "bootstrap file not found: {}",
                    source.display()
                )));
            }
            let dest = project_dir.join("bootstrap.md");
            if source != dest {
                std::fs::copy(source, &dest)?;
            }
            Some(dest)
        }
        None => None,
    };

    let project = db.create_project(CreateProjectInput {
        name: name.to_string(),
        root_dir: project_dir.display().to_string(),
        prd_path: prd_dest.display().to_string(),
        bootstrap_path: bootstrap_dest.as_ref().map(|p| p.display().to_string()),
    })?;

    write_mcp_config(project_dir)?;

    Ok(InitResult {
        project,
        db_path: paths.db_path,
        prd_dest,
        bootstrap_dest,
    })
}

/// Open the store for a directory that must already be initialized.
pub fn open_project(project_dir: &Path) -> Result<(Database, ProjectPaths)> {
    let paths = ProjectPaths::for_root(project_dir);
    if !paths.db_path.exists() {
        return Err(Error::NoProject);
    }
    let db = Database::open(&paths.db_path)?;
    Ok((db, paths))
}
