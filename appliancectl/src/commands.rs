//! Command definitions and output formatting.

use crate::client::ApiClient;
use anyhow::{Context, Result};
use appliance_operator::appliance::{Appliance, ApplianceKey, ConditionStatus};
use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "appliancectl")]
#[command(author, version, about = "Declare appliance power state and inspect reconciliation", long_about = None)]
pub struct Cli {
    /// Operator API URL
    #[arg(long, global = true, env = "APPLIANCE_API_URL", default_value = "http://localhost:3000")]
    pub api_url: String,

    /// Print raw JSON instead of a table
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List declared appliances
    List {
        #[arg(long, short)]
        namespace: Option<String>,
    },

    /// Show one appliance
    Get {
        namespace: String,
        name: String,
    },

    /// Declare the desired power state
    Power {
        namespace: String,
        name: String,
        state: PowerState,
    },

    /// Remove an appliance declaration
    Delete {
        namespace: String,
        name: String,
    },

    /// Show operator health
    Health,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum PowerState {
    On,
    Off,
}

impl From<PowerState> for bool {
    fn from(state: PowerState) -> Self {
        state == PowerState::On
    }
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let client = ApiClient::new(&self.api_url)?;

        match self.command {
            Command::List { namespace } => {
                let appliances = client.list(namespace.as_deref()).await?;
                if self.json {
                    print_json(&appliances)?;
                } else {
                    print_table(&appliances);
                }
            }
            Command::Get { namespace, name } => {
                let key = parse_key(&namespace, &name)?;
                let appliance = client.get(&key).await?;
                if self.json {
                    print_json(&appliance)?;
                } else {
                    print_table(std::slice::from_ref(&appliance));
                }
            }
            Command::Power {
                namespace,
                name,
                state,
            } => {
                let key = parse_key(&namespace, &name)?;
                let appliance = client.set_power(&key, state.into()).await?;
                if self.json {
                    print_json(&appliance)?;
                } else {
                    println!(
                        "{} desired power {} (generation {})",
                        appliance.key,
                        on_off(appliance.spec.power),
                        appliance.generation
                    );
                }
            }
            Command::Delete { namespace, name } => {
                let key = parse_key(&namespace, &name)?;
                client.delete(&key).await?;
                println!("{} deleted", key);
            }
            Command::Health => {
                let (healthy, body) = client.health().await?;
                print_json(&body)?;
                if !healthy {
                    anyhow::bail!("operator is degraded");
                }
            }
        }

        Ok(())
    }
}

fn parse_key(namespace: &str, name: &str) -> Result<ApplianceKey> {
    ApplianceKey::parse(namespace, name).context("Invalid appliance key")
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn on_off(power: bool) -> &'static str {
    if power {
        "on"
    } else {
        "off"
    }
}

/// One table row: key, desired, observed, sync state, generation
pub fn row(appliance: &Appliance) -> [String; 5] {
    let synced = match appliance.powered_on() {
        None => "pending",
        Some(_) if appliance.status.observed_generation < appliance.generation => "pending",
        Some(c) if c.status == ConditionStatus::Unknown => "unknown",
        Some(_) if appliance.status.observed_power == appliance.spec.power => "synced",
        Some(_) => "drift",
    };
    [
        appliance.key.to_string(),
        on_off(appliance.spec.power).to_string(),
        on_off(appliance.status.observed_power).to_string(),
        synced.to_string(),
        appliance.generation.to_string(),
    ]
}

fn print_table(appliances: &[Appliance]) {
    if appliances.is_empty() {
        println!("No appliances found");
        return;
    }

    let header = ["APPLIANCE", "DESIRED", "OBSERVED", "STATE", "GENERATION"].map(String::from);
    let rows: Vec<[String; 5]> = appliances.iter().map(row).collect();

    let mut widths = header.clone().map(|h| h.len());
    for r in &rows {
        for (width, cell) in widths.iter_mut().zip(r) {
            *width = (*width).max(cell.len());
        }
    }

    for r in std::iter::once(&header).chain(rows.iter()) {
        let line: Vec<String> = r
            .iter()
            .zip(widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect();
        println!("{}", line.join("  ").trim_end());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appliance_operator::appliance::{
        set_status_condition, ApplianceSpec, Condition, CONDITION_POWERED_ON, REASON_UPDATED,
    };

    fn appliance(desired: bool) -> Appliance {
        Appliance::new(ApplianceKey::new("default", "kitchen1"), ApplianceSpec { power: desired })
    }

    fn reconciled(mut a: Appliance, observed: bool) -> Appliance {
        a.status.observed_power = observed;
        a.status.observed_generation = a.generation;
        set_status_condition(
            &mut a.status.conditions,
            Condition::new(CONDITION_POWERED_ON, observed.into(), REASON_UPDATED, "test"),
        );
        a
    }

    #[test]
    fn test_cli_parses_power_command() {
        let cli = Cli::try_parse_from(["appliancectl", "power", "default", "kitchen1", "on"]).unwrap();
        assert_eq!(cli.api_url, "http://localhost:3000");
        match cli.command {
            Command::Power { namespace, name, state } => {
                assert_eq!(namespace, "default");
                assert_eq!(name, "kitchen1");
                assert!(bool::from(state));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_cli_rejects_unknown_power_state() {
        assert!(Cli::try_parse_from(["appliancectl", "power", "default", "kitchen1", "maybe"]).is_err());
    }

    #[test]
    fn test_row_states() {
        assert_eq!(row(&appliance(true))[3], "pending");
        assert_eq!(row(&reconciled(appliance(true), true))[3], "synced");
        assert_eq!(row(&reconciled(appliance(true), false))[3], "drift");

        let mut stale = reconciled(appliance(true), true);
        stale.generation += 1;
        assert_eq!(row(&stale)[3], "pending");

        let r = row(&reconciled(appliance(false), false));
        assert_eq!(r[0], "default/kitchen1");
        assert_eq!(r[1], "off");
        assert_eq!(r[4], "1");
    }
}
