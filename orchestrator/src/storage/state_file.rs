//! Persisted deployment state

use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::models::deployment::DeploymentState;

/// Load the last recorded deployment state, if any
pub async fn load_state(state_file: &File) -> Result<Option<DeploymentState>, DeployError> {
    if !state_file.exists().await {
        return Ok(None);
    }
    state_file.read_json().await.map(Some)
}

/// Save the deployment state
pub async fn save_state(state_file: &File, state: &DeploymentState) -> Result<(), DeployError> {
    state_file.write_json(state).await
}
