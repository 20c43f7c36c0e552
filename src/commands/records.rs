use clap::{Args, Subcommand};
use medisync_core::{Coordinator, Entity, EntityStore, Fields, Record, SyncNotice, SyncStatus};
use serde_json::Value;
use tokio::sync::broadcast;

use super::{EntityKind, OutputFormat};

#[derive(Args)]
pub struct RecordsCommand {
    /// Collection to work on
    #[arg(value_enum)]
    pub entity: EntityKind,

    #[command(subcommand)]
    pub command: RecordsSubcommand,
}

#[derive(Subcommand)]
pub enum RecordsSubcommand {
    /// List all records
    List {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Show a record
    Show {
        /// Record ID
        id: String,

        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Add a record
    Add {
        /// Field as KEY=TEXT or KEY:=JSON (can be repeated)
        #[arg(long = "field", short = 'f', value_name = "FIELD", required = true)]
        fields: Vec<String>,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Update fields of a record
    Update {
        /// Record ID
        id: String,

        /// Field as KEY=TEXT or KEY:=JSON (can be repeated)
        #[arg(long = "field", short = 'f', value_name = "FIELD", required = true)]
        fields: Vec<String>,

        /// Output format
        #[arg(long, value_enum, default_value = "text")]
        format: OutputFormat,
    },

    /// Delete a record
    Delete {
        /// Record ID
        id: String,
    },
}

impl RecordsCommand {
    pub async fn run(&self, coordinator: &Coordinator) -> Result<(), Box<dyn std::error::Error>> {
        let stores = coordinator.stores();
        with_store!(stores, self.entity, |store| self.run_on(&store).await)
    }

    async fn run_on<E: Entity>(
        &self,
        store: &EntityStore<E>,
    ) -> Result<(), Box<dyn std::error::Error>> {
        store.ready().await;
        let mut notices = store.notices();

        match &self.command {
            RecordsSubcommand::List { format } => print_records(&store.records(), *format),

            RecordsSubcommand::Show { id, format } => {
                let record = store
                    .get_by_id(id)
                    .ok_or_else(|| format!("Record not found: {}", id))?;
                print_record(&record, *format)
            }

            RecordsSubcommand::Add { fields, format } => {
                let data: E = serde_json::from_value(Value::Object(parse_fields(fields)?))
                    .map_err(|e| format!("Invalid {} record: {}", E::COLLECTION, e))?;
                let id = store.add(data).await?;
                report_notices(&mut notices);

                let record = store
                    .get_by_id(id.as_str())
                    .ok_or_else(|| format!("Record not found: {}", id))?;
                println!("Created record:");
                print_record(&record, *format)
            }

            RecordsSubcommand::Update { id, fields, format } => {
                if store.get_by_id(id).is_none() {
                    return Err(format!("Record not found: {}", id).into());
                }
                store.update(id, parse_fields(fields)?).await?;
                report_notices(&mut notices);

                let record = store
                    .get_by_id(id)
                    .ok_or_else(|| format!("Record not found: {}", id))?;
                println!("Updated record:");
                print_record(&record, *format)
            }

            RecordsSubcommand::Delete { id } => {
                if store.get_by_id(id).is_none() {
                    return Err(format!("Record not found: {}", id).into());
                }
                store.delete(id).await;
                report_notices(&mut notices);

                if store.get_by_id(id).is_some() {
                    return Err(format!("Could not delete {}", id).into());
                }
                println!("Deleted record: {}", id);
                Ok(())
            }
        }
    }
}

/// Parses `KEY=TEXT` and `KEY:=JSON` assignments.
pub(crate) fn parse_fields(assignments: &[String]) -> Result<Fields, String> {
    let mut fields = Fields::new();
    for assignment in assignments {
        let pos = assignment.find('=').ok_or_else(|| {
            format!(
                "Invalid field '{}'. Expected KEY=TEXT or KEY:=JSON",
                assignment
            )
        })?;
        let raw = &assignment[pos + 1..];
        let (key, value) = match assignment[..pos].strip_suffix(':') {
            Some(key) => {
                let value = serde_json::from_str(raw)
                    .map_err(|e| format!("Invalid JSON for '{}': {}", key, e))?;
                (key, value)
            }
            None => (&assignment[..pos], Value::String(raw.to_string())),
        };
        if key.is_empty() {
            return Err(format!("Missing field name in '{}'", assignment));
        }
        fields.insert(key.to_string(), value);
    }
    Ok(fields)
}

/// Prints queued-write notices to stderr.
pub(crate) fn report_notices(notices: &mut broadcast::Receiver<SyncNotice>) {
    while let Ok(notice) = notices.try_recv() {
        eprintln!("{}", notice);
    }
}

pub(crate) fn sync_label(status: &SyncStatus) -> &'static str {
    if status.is_offline {
        "offline"
    } else if status.sync_error {
        "error"
    } else {
        "synced"
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let head: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", head)
}

pub(crate) fn print_records<E: Entity>(
    records: &[Record<E>],
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    if records.is_empty() {
        println!("No records found");
        return Ok(());
    }

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(records)?);
        }
        OutputFormat::Text => {
            println!("{:<38}  {:<8}  DATA", "ID", "SYNC");
            println!("{}", "-".repeat(100));
            for record in records {
                let data = serde_json::to_string(&record.data)?;
                println!(
                    "{:<38}  {:<8}  {}",
                    record.id,
                    sync_label(&record.sync),
                    truncate(&data, 50)
                );
            }
            println!("\nTotal: {} record(s)", records.len());
        }
    }
    Ok(())
}

pub(crate) fn print_record<E: Entity>(
    record: &Record<E>,
    format: OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(record)?);
        }
        OutputFormat::Text => {
            println!("{:<22} {}", "id:", record.id);
            if let Value::Object(fields) = serde_json::to_value(record)? {
                for (key, value) in fields.into_iter().filter(|(key, _)| key != "id") {
                    let shown = match value {
                        Value::String(s) => s,
                        Value::Null => "-".to_string(),
                        other => other.to_string(),
                    };
                    println!("{:<22} {}", format!("{}:", key), shown);
                }
            }
            println!("{:<22} {}", "sync:", sync_label(&record.sync));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_text_and_json_fields() {
        let fields = parse_fields(&args(&[
            "name=Ada Lovelace",
            "phone=555",
            "quantity:=3",
            "allergies:=[\"penicillin\"]",
        ]))
        .unwrap();

        assert_eq!(fields["name"], json!("Ada Lovelace"));
        assert_eq!(fields["phone"], json!("555"));
        assert_eq!(fields["quantity"], json!(3));
        assert_eq!(fields["allergies"], json!(["penicillin"]));
    }

    #[test]
    fn test_parse_value_containing_separator() {
        let fields = parse_fields(&args(&["notes=a=b:=c"])).unwrap();
        assert_eq!(fields["notes"], json!("a=b:=c"));
    }

    #[test]
    fn test_parse_invalid_fields() {
        assert!(parse_fields(&args(&["name"])).is_err());
        assert!(parse_fields(&args(&["=value"])).is_err());
        assert!(parse_fields(&args(&["count:=not json"])).is_err());
    }

    #[test]
    fn test_sync_label() {
        assert_eq!(sync_label(&SyncStatus::default()), "synced");
        assert_eq!(sync_label(&SyncStatus::failed()), "offline");
        let errored = SyncStatus {
            sync_error: true,
            is_offline: false,
        };
        assert_eq!(sync_label(&errored), "error");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghijk", 8), "abcde...");
    }

    #[test]
    fn test_parsed_fields_build_an_entity() {
        let fields = parse_fields(&args(&["name=Ada", "phone=555"])).unwrap();
        let patient: medisync_core::Patient =
            serde_json::from_value(Value::Object(fields)).unwrap();
        assert_eq!(patient.name, "Ada");
        assert_eq!(patient.phone.as_deref(), Some("555"));
    }
}
