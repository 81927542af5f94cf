// Writes manifest files as `---` separated YAML streams.

use crate::error::{MigrateError, Result};
use crate::synth::ManifestFile;
use serde_yaml::{Mapping, Value};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Metadata the platform fills in; it never belongs in a manifest.
const SERVER_METADATA: [&str; 6] = [
    "creationTimestamp",
    "resourceVersion",
    "uid",
    "managedFields",
    "generation",
    "selfLink",
];

fn strip_null_timestamps(value: &mut Value) {
    match value {
        Value::Mapping(map) => {
            if map.get("creationTimestamp").is_some_and(Value::is_null) {
                map.remove("creationTimestamp");
            }
            for (_, v) in map.iter_mut() {
                strip_null_timestamps(v);
            }
        }
        Value::Sequence(seq) => seq.iter_mut().for_each(strip_null_timestamps),
        _ => {}
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Mapping(m) => m.is_empty(),
        _ => false,
    }
}

/// Drops null timestamps anywhere, server-populated metadata and an empty status.
pub fn normalize(mut document: Value) -> Value {
    strip_null_timestamps(&mut document);
    if let Value::Mapping(root) = &mut document {
        if root.get("status").is_some_and(is_empty) {
            root.remove("status");
        }
        if let Some(Value::Mapping(meta)) = root.get_mut("metadata") {
            strip_server_metadata(meta);
        }
    }
    document
}

fn strip_server_metadata(meta: &mut Mapping) {
    for key in SERVER_METADATA {
        meta.remove(key);
    }
}

/// Serializes a file's documents into one stream.
pub fn render(file: &ManifestFile) -> Result<String> {
    let mut out = String::new();
    for (i, doc) in file.documents.iter().enumerate() {
        if i > 0 {
            out.push_str("---\n");
        }
        out.push_str(&serde_yaml::to_string(&normalize(doc.clone()))?);
    }
    Ok(out)
}

/// Writes through a sibling temporary file and a rename, so a file is either
/// complete or absent.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.tmp", file_name));
    let io_err = |p: &Path, e| MigrateError::io(p.display().to_string(), e);

    let mut f = fs::File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
    f.write_all(contents.as_bytes())
        .and_then(|_| f.sync_all())
        .map_err(|e| io_err(&tmp, e))?;
    drop(f);
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        io_err(path, e)
    })
}

/// Renders every file, then writes them into `dir`, creating it if needed.
/// Nothing is written when any file fails to render.
pub fn emit(dir: &Path, files: &[ManifestFile]) -> Result<Vec<PathBuf>> {
    let rendered = files
        .iter()
        .map(|f| Ok((f.name.as_str(), render(f)?)))
        .collect::<Result<Vec<_>>>()?;
    fs::create_dir_all(dir).map_err(|e| MigrateError::io(dir.display().to_string(), e))?;

    let mut written = Vec::with_capacity(rendered.len());
    for (name, contents) in rendered {
        let path = dir.join(name);
        write_atomic(&path, &contents)?;
        debug!(path = %path.display(), bytes = contents.len(), "wrote manifest");
        written.push(path);
    }
    info!(dir = %dir.display(), files = written.len(), "emitted manifests");
    Ok(written)
}
