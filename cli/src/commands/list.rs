//! `vmpull list` command.

use clap::Args;
use serde::Serialize;
use vmpull_runtime::oci::PublishedVm;
use vmpull_runtime::VmStorage;

use crate::output;

#[derive(Args)]
pub struct ListArgs {
    /// Only show VM names (one per line)
    #[arg(short, long)]
    pub quiet: bool,

    /// Print as JSON
    #[arg(long)]
    pub json: bool,
}

/// Display fields for a single VM row.
#[derive(Debug, Serialize)]
struct VmRow {
    name: String,
    digest: String,
    size_bytes: Option<u64>,
    pulled_at: Option<chrono::DateTime<chrono::Utc>>,
    path: String,
}

impl VmRow {
    fn from_published(vm: &PublishedVm) -> Self {
        Self {
            name: vm.record.name.clone(),
            digest: vm.record.manifest_digest.to_string(),
            size_bytes: Some(vm.record.size_bytes),
            pulled_at: Some(vm.record.pulled_at),
            path: vm.path.display().to_string(),
        }
    }

    fn local(name: String, path: String) -> Self {
        Self {
            name,
            digest: "<local>".to_string(),
            size_bytes: None,
            pulled_at: None,
            path,
        }
    }
}

pub async fn execute(args: ListArgs) -> Result<(), Box<dyn std::error::Error>> {
    let storage = super::storage();
    let namespace = VmStorage::new(&storage)?;

    let mut rows: Vec<VmRow> = namespace.list()?.iter().map(VmRow::from_published).collect();
    for name in namespace.list_local()? {
        let path = storage.vms_dir().join(&name).display().to_string();
        rows.push(VmRow::local(name, path));
    }

    if args.quiet {
        for row in &rows {
            println!("{}", row.name);
        }
        return Ok(());
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!("{}", render_table(&rows));
    Ok(())
}

fn render_table(rows: &[VmRow]) -> comfy_table::Table {
    let mut table = output::new_table(&["NAME", "DIGEST", "SIZE", "PULLED"]);
    for row in rows {
        table.add_row(vec![
            row.name.clone(),
            output::short_digest(&row.digest),
            row.size_bytes
                .map(output::format_bytes)
                .unwrap_or_else(|| "-".to_string()),
            row.pulled_at
                .as_ref()
                .map(output::format_ago)
                .unwrap_or_else(|| "-".to_string()),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_local_row() {
        let rows = vec![VmRow::local("dev-box".to_string(), "/tmp/vms/dev-box".to_string())];
        let rendered = render_table(&rows).to_string();
        assert!(rendered.contains("NAME"));
        assert!(rendered.contains("dev-box"));
        assert!(rendered.contains("<local>"));
    }

    #[test]
    fn test_rows_serialize() {
        let rows = vec![VmRow::local("dev-box".to_string(), "/vms/dev-box".to_string())];
        let json = serde_json::to_value(&rows).unwrap();
        assert_eq!(json[0]["name"], "dev-box");
        assert!(json[0]["size_bytes"].is_null());
    }
}
