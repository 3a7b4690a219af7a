//! `list-ports` command implementation.

use anyhow::{Context, Result};
use console::style;
use flashdock::PortDescriptor;

/// JSON view of the port list.
fn ports_json(ports: &[PortDescriptor]) -> serde_json::Value {
    ports
        .iter()
        .map(|p| {
            serde_json::json!({
                "device": p.device,
                "label": p.label,
            })
        })
        .collect()
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = flashdock::list_ports();

    if json {
        let text = serde_json::to_string_pretty(&ports_json(&ports))
            .context("Failed to serialize port list")?;
        println!("{text}");
        return Ok(());
    }

    eprintln!("{}", style("Serial ports").bold().underlined());

    if ports.is_empty() {
        eprintln!("  {}", style("No ports found").dim());
    } else {
        for port in &ports {
            println!("  {} {}", style("•").green(), style(&port.label).cyan());
        }
    }

    Ok(())
}
