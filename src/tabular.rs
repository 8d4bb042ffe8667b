use anyhow::Context;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use zip::ZipArchive;

/// One parsed tabular upload: a header row plus data rows. Cells are kept as
/// raw text; typing happens in the import validator.
#[derive(Debug)]
pub struct Sheet {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Sheet {
    fn from_grid(mut grid: Vec<Vec<String>>) -> anyhow::Result<Self> {
        // Leading fully-empty lines before the header are tolerated.
        while grid
            .first()
            .is_some_and(|r| r.iter().all(|c| c.trim().is_empty()))
        {
            grid.remove(0);
        }
        if grid.is_empty() {
            anyhow::bail!("file has no header row");
        }
        let headers = grid.remove(0);
        Ok(Self {
            headers,
            rows: grid,
        })
    }
}

pub fn read_table(path: &Path) -> anyhow::Result<Sheet> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "csv" => read_csv(path),
        "xlsx" => read_xlsx(path),
        other => anyhow::bail!(
            "unsupported file type '.{}'; use .csv or .xlsx",
            other
        ),
    }
}

fn read_csv(path: &Path) -> anyhow::Result<Sheet> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read {}", path.to_string_lossy()))?;
    let text = String::from_utf8_lossy(&bytes);
    Sheet::from_grid(parse_csv_text(&text))
}

fn parse_csv_text(text: &str) -> Vec<Vec<String>> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;

    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' => {
                    // Doubled quote inside a quoted field is a literal quote.
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        in_quotes = false;
                    }
                }
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
            }
            _ => field.push(c),
        }
    }
    if !field.is_empty() || !row.is_empty() {
        row.push(field);
        rows.push(row);
    }
    rows
}

fn read_xlsx(path: &Path) -> anyhow::Result<Sheet> {
    let file = File::open(path)
        .with_context(|| format!("failed to open {}", path.to_string_lossy()))?;
    let mut archive = ZipArchive::new(file).context("not a valid .xlsx workbook")?;

    let shared = match archive.by_name("xl/sharedStrings.xml") {
        Ok(mut entry) => {
            let mut xml = String::new();
            entry
                .read_to_string(&mut xml)
                .context("failed to read shared strings")?;
            parse_shared_strings(&xml)
        }
        Err(_) => Vec::new(),
    };

    // Sheets are stored as xl/worksheets/sheetN.xml; take the first one.
    let sheet_name = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/") && n.ends_with(".xml"))
        .min()
        .map(str::to_string)
        .context("workbook has no worksheet")?;
    let mut sheet_xml = String::new();
    archive
        .by_name(&sheet_name)
        .context("failed to open worksheet")?
        .read_to_string(&mut sheet_xml)
        .context("failed to read worksheet")?;

    Sheet::from_grid(parse_worksheet(&sheet_xml, &shared))
}

/// Shared strings: each `<si>` item is the concatenation of its `<t>` runs.
fn parse_shared_strings(xml: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<si>").or_else(|| rest.find("<si ")) {
        let after = &rest[start..];
        let Some(end) = after.find("</si>") else {
            break;
        };
        out.push(collect_t_text(&after[..end]));
        rest = &after[end + 5..];
    }
    out
}

fn collect_t_text(fragment: &str) -> String {
    let mut text = String::new();
    let mut rest = fragment;
    while let Some(open) = rest.find("<t") {
        let after_open = &rest[open + 2..];
        // Must be "<t>" or "<t ...>", not "<tc...>" etc.
        let Some(gt) = after_open.find('>') else {
            break;
        };
        let tag_rest = &after_open[..gt];
        if !(tag_rest.is_empty() || tag_rest.starts_with(' ') || tag_rest.starts_with('/')) {
            rest = &after_open[gt + 1..];
            continue;
        }
        if tag_rest.ends_with('/') {
            // Self-closing <t/> is an empty run.
            rest = &after_open[gt + 1..];
            continue;
        }
        let body = &after_open[gt + 1..];
        let Some(close) = body.find("</t>") else {
            break;
        };
        text.push_str(&xml_unescape(&body[..close]));
        rest = &body[close + 4..];
    }
    text
}

fn parse_worksheet(xml: &str, shared: &[String]) -> Vec<Vec<String>> {
    let mut grid: Vec<Vec<String>> = Vec::new();
    let mut rest = xml;
    while let Some(start) = rest.find("<row") {
        let after = &rest[start + 4..];
        let Some(gt) = after.find('>') else {
            break;
        };
        let attrs = &after[..gt];
        if attrs.ends_with('/') {
            grid.push(Vec::new());
            rest = &after[gt + 1..];
            continue;
        }
        let body_and_rest = &after[gt + 1..];
        let Some(end) = body_and_rest.find("</row>") else {
            break;
        };
        grid.push(parse_row_cells(&body_and_rest[..end], shared));
        rest = &body_and_rest[end + 6..];
    }
    grid
}

fn parse_row_cells(row_xml: &str, shared: &[String]) -> Vec<String> {
    let mut cells: Vec<String> = Vec::new();
    let mut rest = row_xml;
    while let Some(start) = rest.find("<c") {
        let after = &rest[start + 2..];
        // Guard against matching "<co..." style tags.
        if !(after.starts_with(' ') || after.starts_with('>') || after.starts_with('/')) {
            rest = after;
            continue;
        }
        let Some(gt) = after.find('>') else {
            break;
        };
        let attrs = &after[..gt];
        let self_closing = attrs.ends_with('/');
        let cell_ref = attr_value(attrs, "r");
        let cell_type = attr_value(attrs, "t").unwrap_or_default();

        let value = if self_closing {
            String::new()
        } else {
            let body_and_rest = &after[gt + 1..];
            let Some(end) = body_and_rest.find("</c>") else {
                break;
            };
            let body = &body_and_rest[..end];
            match cell_type.as_str() {
                "s" => {
                    let idx: usize = element_text(body, "v")
                        .and_then(|v| v.trim().parse().ok())
                        .unwrap_or(usize::MAX);
                    shared.get(idx).cloned().unwrap_or_default()
                }
                "inlineStr" => collect_t_text(body),
                _ => element_text(body, "v")
                    .map(|v| xml_unescape(&v))
                    .unwrap_or_default(),
            }
        };

        let col = cell_ref
            .as_deref()
            .map(column_index)
            .unwrap_or(cells.len());
        if col >= cells.len() {
            cells.resize(col + 1, String::new());
        }
        cells[col] = value;

        if self_closing {
            rest = &after[gt + 1..];
        } else {
            let body_and_rest = &after[gt + 1..];
            let end = body_and_rest.find("</c>").unwrap_or(0);
            rest = &body_and_rest[end + 4..];
        }
    }
    cells
}

fn attr_value(attrs: &str, name: &str) -> Option<String> {
    let needle = format!("{}=\"", name);
    let mut rest = attrs;
    while let Some(pos) = rest.find(&needle) {
        // Attribute names are preceded by whitespace.
        let ok_start = pos == 0
            || rest[..pos]
                .chars()
                .next_back()
                .is_some_and(|c| c.is_whitespace());
        let after = &rest[pos + needle.len()..];
        if !ok_start {
            rest = after;
            continue;
        }
        let end = after.find('"')?;
        return Some(after[..end].to_string());
    }
    None
}

fn element_text(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(body[start..end].to_string())
}

/// "A" -> 0, "B" -> 1, "AA" -> 26. Trailing digits (the row number) are ignored.
fn column_index(cell_ref: &str) -> usize {
    let mut col: usize = 0;
    for c in cell_ref.chars() {
        if c.is_ascii_alphabetic() {
            col = col * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1);
        } else {
            break;
        }
    }
    col.saturating_sub(1)
}

fn xml_unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp..];
        let Some(semi) = after.find(';') else {
            out.push_str(after);
            return out;
        };
        let entity = &after[1..semi];
        match entity {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            _ => {
                let decoded = entity
                    .strip_prefix("#x")
                    .and_then(|h| u32::from_str_radix(h, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                    .and_then(char::from_u32);
                match decoded {
                    Some(c) => out.push(c),
                    None => {
                        out.push('&');
                        out.push_str(entity);
                        out.push(';');
                    }
                }
            }
        }
        rest = &after[semi + 1..];
    }
    out.push_str(rest);
    out
}
