use anyhow::{bail, Result};
use shepherd_conductor::agent::AgentCli;
use shepherd_conductor::config::ShepherdConfig;
use shepherd_conductor::git::GitOps;
use shepherd_conductor::hosting::github::GhCli;

/// Execute `shepherd doctor`
pub fn execute(config: &ShepherdConfig) -> Result<()> {
    let rt = tokio::runtime::Runtime::new()?;
    let probes = rt.block_on(async {
        vec![
            ("git", GitOps::from_config(config).verify_available().await),
            (
                "gh",
                GhCli::new(config.hosting.gh_bin.clone(), config.hosting.host.clone())
                    .verify_available()
                    .await,
            ),
            ("agent", AgentCli::from_config(&config.agent).verify_available().await),
        ]
    });

    let mut failed = 0;
    for (name, result) in &probes {
        match result {
            Ok(()) => println!("  ok       {name}"),
            Err(e) => {
                failed += 1;
                println!("  missing  {name}: {e:#}");
            }
        }
    }
    println!("  workspaces: {}", config.workspaces_root().display());

    if failed > 0 {
        bail!("{failed} of {} prerequisites unavailable", probes.len());
    }
    Ok(())
}
