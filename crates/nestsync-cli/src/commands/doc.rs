//! Document command handlers

use std::io::Read;

use anyhow::{bail, Context, Result};

use nestsync_core::{Body, ChangeEntry, DocumentStore, Revision};

use super::with_hint;
use crate::output::{Output, OutputFormat};

/// Parse a JSON object body; `-` reads it from stdin
pub fn parse_body(input: &str) -> Result<Body> {
    let text = if input == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read body from stdin")?;
        buf
    } else {
        input.to_string()
    };

    let value: serde_json::Value =
        serde_json::from_str(&text).context("Body is not valid JSON")?;
    match value {
        serde_json::Value::Object(body) => Ok(body),
        other => bail!("Body must be a JSON object, got: {}", other),
    }
}

/// Parse an optional `--rev` argument
pub fn parse_revision(rev: Option<&str>) -> Result<Option<Revision>> {
    rev.map(|r| r.parse::<Revision>().context("Invalid --rev"))
        .transpose()
}

/// Create or update a document
pub fn put(
    store: &DocumentStore,
    id: String,
    body: String,
    rev: Option<String>,
    output: &Output,
) -> Result<Revision> {
    let body = parse_body(&body)?;
    let expected = parse_revision(rev.as_deref())?;

    let revision = store.put(&id, body, expected.as_ref()).map_err(with_hint)?;
    match output.format {
        OutputFormat::Quiet => println!("{}", revision),
        _ => output.success(&format!("{} {} @ {}", store.name(), id, revision)),
    }
    Ok(revision)
}

/// Show a document (current revision, or a specific one)
pub fn get(store: &DocumentStore, id: String, rev: Option<String>, output: &Output) -> Result<()> {
    let doc = match parse_revision(rev.as_deref())? {
        Some(rev) => store.get_revision(&id, &rev)?,
        None => store.get(&id)?,
    };
    output.print_document(&doc);

    let conflicts = store.conflicts(&id)?;
    if !conflicts.is_empty() && !output.is_quiet() {
        eprintln!(
            "⚠ {} conflicting revision(s). See: nestsync conflicts {} {}",
            conflicts.len(),
            store.name(),
            id
        );
    }
    Ok(())
}

/// Delete a document
pub fn delete(store: &DocumentStore, id: String, rev: String, output: &Output) -> Result<Revision> {
    let expected: Revision = rev.parse().context("Invalid --rev")?;
    let tombstone = store.delete(&id, &expected).map_err(with_hint)?;
    match output.format {
        OutputFormat::Quiet => println!("{}", tombstone),
        _ => output.success(&format!("Deleted {} {} @ {}", store.name(), id, tombstone)),
    }
    Ok(tombstone)
}

/// List documents
pub fn list(store: &DocumentStore, include_deleted: bool, output: &Output) -> Result<()> {
    let docs = store.all_documents(include_deleted)?;
    output.print_documents(&docs);
    Ok(())
}

/// List non-winning leaf revisions
pub fn conflicts(store: &DocumentStore, id: String, output: &Output) -> Result<()> {
    let conflicts = store.conflicts(&id)?;
    output.print_revisions(
        &format!("Conflicting revisions of {}", id),
        &format!("No conflicts on {}.", id),
        &conflicts,
    );
    Ok(())
}

/// Show the ancestry of a revision (current by default)
pub fn history(store: &DocumentStore, id: String, rev: Option<String>, output: &Output) -> Result<()> {
    let rev = match parse_revision(rev.as_deref())? {
        Some(rev) => rev,
        None => store.current_revision(&id)?,
    };
    let history = store.revision_history(&id, &rev)?;
    output.print_revisions(&format!("History of {} from {}", id, rev), "", &history);
    Ok(())
}

/// Show change feed entries after a sequence number
pub fn changes(store: &DocumentStore, since: u64, limit: usize, output: &Output) -> Result<()> {
    let changes = store
        .changes_since(since)?
        .take(limit)
        .collect::<Result<Vec<ChangeEntry>, _>>()?;
    output.print_changes(&changes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> Output {
        Output::new(OutputFormat::Quiet)
    }

    #[test]
    fn test_parse_body() {
        let body = parse_body(r#"{"amount": 12.5, "category": "Food"}"#).unwrap();
        assert_eq!(body["category"], "Food");

        assert!(parse_body("[1, 2]").is_err());
        assert!(parse_body("{not json").is_err());
    }

    #[test]
    fn test_parse_revision() {
        assert_eq!(parse_revision(None).unwrap(), None);
        assert_eq!(
            parse_revision(Some("2-abcd")).unwrap(),
            Some(Revision::new(2, "abcd"))
        );
        assert!(parse_revision(Some("abcd")).is_err());
    }

    #[test]
    fn test_put_update_delete_flow() {
        let store = DocumentStore::open_in_memory("expenses").unwrap();
        let output = quiet();

        let r1 = put(&store, "e1".into(), r#"{"amount": 5}"#.into(), None, &output).unwrap();
        let r2 = put(
            &store,
            "e1".into(),
            r#"{"amount": 6}"#.into(),
            Some(r1.to_string()),
            &output,
        )
        .unwrap();

        // Stale revision is refused
        assert!(put(
            &store,
            "e1".into(),
            r#"{"amount": 7}"#.into(),
            Some(r1.to_string()),
            &output
        )
        .is_err());

        delete(&store, "e1".into(), r2.to_string(), &output).unwrap();
        assert!(get(&store, "e1".into(), None, &output).is_err());
        assert!(get(&store, "e1".into(), Some(r2.to_string()), &output).is_ok());
        history(&store, "e1".into(), None, &output).unwrap();
    }

    #[test]
    fn test_read_commands_on_empty_store() {
        let store = DocumentStore::open_in_memory("notes").unwrap();
        let output = quiet();

        list(&store, true, &output).unwrap();
        changes(&store, 0, 10, &output).unwrap();
        assert!(conflicts(&store, "missing".into(), &output).is_err());
    }
}
