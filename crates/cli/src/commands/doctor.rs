//! Local environment checks

use anyhow::Result;
use colored::Colorize;
use debug_lib::{docker, DebugConfig};

use super::Context;
use crate::output::{print_header, print_json, print_success, OutputFormat};

/// Check that the container daemon answers, then show its versions
pub async fn run(ctx: &Context) -> Result<()> {
    docker::check_available(&ctx.config).await?;
    let version = docker::version(&ctx.config).await?;

    match ctx.format {
        OutputFormat::Json => print_json(&version),
        OutputFormat::Table => {
            print_header("Doctor");
            print_success(&format!("{} daemon is responding", ctx.config.daemon_binary));
            println!();
            println!("{}", "Client".bold());
            println!("{}", "-".repeat(50));
            println!("Version:      {}", version.client.version.cyan());
            println!("API Version:  {}", version.client.api_version);
            println!("Platform:     {}/{}", version.client.os, version.client.arch);
            if let Some(server) = &version.server {
                println!();
                println!("{}", "Server".bold());
                println!("{}", "-".repeat(50));
                println!("Version:      {}", server.version.cyan());
                println!("API Version:  {}", server.api_version);
                println!("Platform:     {}/{}", server.os, server.arch);
            }
            println!();
            match DebugConfig::default_path() {
                Some(path) if path.exists() => println!("Config file:  {}", path.display()),
                _ => println!("Config file:  {}", "(defaults)".dimmed()),
            }
            println!("Environments: {}", ctx.config.environments.len());
        }
    }
    Ok(())
}
