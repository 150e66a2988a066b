use anyhow::Result;
use serde::Serialize;

use super::Sources;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SignatureRow<'a> {
    id: &'a str,
    name: &'a str,
    kind: &'a str,
    category: Option<&'a str>,
    enabled: bool,
}

/// Print loaded signatures with their enabled state.
pub fn run(sources: &Sources, json: bool) -> Result<()> {
    let settings = sources.settings()?;
    let store = sources.signature_store(&settings)?;

    let rows: Vec<SignatureRow> = store
        .all()
        .iter()
        .map(|s| SignatureRow {
            id: s.id(),
            name: s.name(),
            kind: s.kind(),
            category: s.category(),
            enabled: settings.is_signature_enabled(s.id()),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No signatures loaded");
        return Ok(());
    }

    println!("{:<28} {:<14} {:<8} NAME", "ID", "KIND", "ENABLED");
    for row in &rows {
        println!(
            "{:<28} {:<14} {:<8} {}",
            row.id,
            row.kind,
            if row.enabled { "yes" } else { "no" },
            row.name
        );
    }
    println!(
        "\n{} signatures, {} enabled",
        rows.len(),
        rows.iter().filter(|r| r.enabled).count()
    );
    Ok(())
}
