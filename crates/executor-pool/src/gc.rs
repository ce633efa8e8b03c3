use sandbox::{ContainerOperator, RuntimeError};
use tracing::info;

/// Force-remove every container whose name starts with `prefix`.
///
/// A live pool never loses track of its containers, so anything matching
/// at startup was left behind by a previous process. Returns the number of
/// containers removed.
pub async fn collect_orphans(
    operator: &dyn ContainerOperator,
    prefix: &str,
) -> Result<usize, RuntimeError> {
    let names = operator.container_names(prefix).await?;
    if names.is_empty() {
        info!(prefix = %prefix, "no orphaned containers");
        return Ok(0);
    }

    info!(prefix = %prefix, count = names.len(), "removing orphaned containers");
    operator.remove_containers(&names).await?;
    Ok(names.len())
}
