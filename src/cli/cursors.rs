use anyhow::Result;
use continuum::config::ContinuumConfig;
use continuum::Continuum;

/// List a user's session cursors and how far each has fallen behind its stream.
pub fn cursors(config: ContinuumConfig, user_id: &str) -> Result<()> {
    let engine = Continuum::open(config)?;
    let cursors = engine.cursors.list(user_id)?;

    if cursors.is_empty() {
        println!("No cursors for {user_id}");
        return Ok(());
    }

    println!("Cursors for {user_id}");
    println!("{}", "=".repeat(60));
    for cursor in cursors {
        match engine.cursors.status(&cursor.id) {
            Ok(status) => {
                println!(
                    "  {:<36} {}/{} [{}]",
                    cursor.id,
                    cursor.project_id,
                    cursor.branch,
                    cursor.state.as_str()
                );
                println!(
                    "      position: {}  head: {}  new since pause: {}",
                    status.position.as_deref().unwrap_or("-"),
                    status.head.as_deref().unwrap_or("-"),
                    status.events_since_pause
                );
                println!("      last active: {}", cursor.last_active_at.to_rfc3339());
            }
            Err(err) => {
                println!("  {:<36} {}/{} [unusable: {err}]", cursor.id, cursor.project_id, cursor.branch);
            }
        }
    }

    Ok(())
}
