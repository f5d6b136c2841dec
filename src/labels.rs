use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};

/// Reads a label table, one class per line. Lines may carry trailing
/// comma-separated fields (e.g. `label,r,g,b`); only the first is kept.
pub fn load_labels(filepath: &Path) -> io::Result<Vec<String>> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        let label = line.split(',').next().unwrap_or_default().trim();
        if label.is_empty() {
            continue;
        }
        labels.push(label.to_string());
    }

    if labels.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("No labels found in {}", filepath.display()),
        ));
    }

    Ok(labels)
}

/// Parses the `names` entry Ultralytics writes into ONNX metadata, e.g.
/// `{0: 'motor', 1: 'frame'}`. Indices may be sparse; gaps become
/// `class_<id>`.
pub fn parse_ultralytics_names(raw: &str) -> Option<Vec<String>> {
    let body = raw.trim().strip_prefix('{')?.strip_suffix('}')?;
    let mut entries = Vec::new();

    for entry in body.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (index, name) = entry.split_once(':')?;
        let index: usize = index.trim().parse().ok()?;
        let name = name.trim().trim_matches(&['\'', '"'][..]);
        entries.push((index, name.to_string()));
    }

    let len = entries.iter().map(|(i, _)| i + 1).max()?;
    let mut names: Vec<String> = (0..len).map(|i| format!("class_{}", i)).collect();
    for (index, name) in entries {
        names[index] = name;
    }
    Some(names)
}
