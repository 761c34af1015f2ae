//! Project management commands

use crate::error::{Error, Result};
use crate::meta::{MetaDb, Project};
use tracing::info;

/// Create a project
pub async fn cmd_create_project(db: &MetaDb, name: &str) -> Result<Project> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::Validation("Project name must not be empty".to_string()));
    }
    let project = db.create_project(name).await?;
    info!(project_id = project.id, "Created project '{}'", project.name);
    Ok(project)
}

pub async fn cmd_list_projects(db: &MetaDb) -> Result<Vec<Project>> {
    db.list_projects().await
}

pub fn print_projects(projects: &[Project]) {
    if projects.is_empty() {
        println!("No projects. Use 'reqflow project create <name>' to add one.");
        return;
    }
    for project in projects {
        println!("• [{}] {}", project.id, project.name);
        println!("  Created: {}", project.created_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::tests::setup_test_db;

    #[tokio::test]
    async fn test_create_and_list() {
        let (db, _tmp) = setup_test_db().await;
        let created = cmd_create_project(&db, "  Billing revamp ").await.unwrap();
        assert_eq!(created.name, "Billing revamp");

        let projects = cmd_list_projects(&db).await.unwrap();
        assert_eq!(projects.len(), 1);
        assert_eq!(projects[0].id, created.id);
    }

    #[tokio::test]
    async fn test_blank_name_rejected() {
        let (db, _tmp) = setup_test_db().await;
        assert!(matches!(
            cmd_create_project(&db, "   ").await,
            Err(Error::Validation(_))
        ));
    }
}
