//! Multi-format text extraction for uploaded documents.
//!
//! The endpoint layer supplies raw bytes plus the uploaded filename; this
//! module picks a [`FileKind`] from the extension and returns plain UTF-8
//! text. Office formats (xlsx, pptx, docx) are read directly from their ZIP
//! containers with a streaming XML reader. Formats without a local extractor
//! are handed to the layout-analysis service by the ingestion pipeline.
//!
//! | Kind | Extensions | Output |
//! |------|------------|--------|
//! | plain text | `txt`, `md`, `text` | bytes decoded as strict UTF-8 |
//! | spreadsheet | `xlsx` | `--- Sheet: <name> ---` then one `a | b` line per row |
//! | delimited | `csv` | one `a | b` line per record |
//! | slide deck | `pptx` | shape text, and one `a | b` line per table row |
//! | word processor | `docx` | paragraphs joined by `\n` |
//! | PDF | `pdf` | layout service, or `pdf-extract` when none is configured |

use std::collections::HashMap;
use std::fmt;
use std::io::{Cursor, Read};

use quick_xml::events::{BytesStart, Event};
use thiserror::Error;

/// Maximum sheets to process in an xlsx.
const XLSX_MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet (avoids unbounded memory).
const XLSX_MAX_CELLS_PER_SHEET: usize = 100_000;
/// Widest sheet a workbook can hold (column `XFD`).
const XLSX_MAX_COLUMNS: usize = 16_384;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

const CELL_SEPARATOR: &str = " | ";

type OoxmlArchive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

/// File format, decided by the uploaded filename's extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    PlainText,
    Spreadsheet,
    Delimited,
    Presentation,
    WordProcessing,
    Pdf,
    Other,
}

impl FileKind {
    pub fn from_filename(filename: &str) -> Self {
        let ext = filename
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "txt" | "md" | "text" => FileKind::PlainText,
            "xlsx" => FileKind::Spreadsheet,
            "csv" => FileKind::Delimited,
            "pptx" => FileKind::Presentation,
            "docx" => FileKind::WordProcessing,
            "pdf" => FileKind::Pdf,
            _ => FileKind::Other,
        }
    }

    /// Whether text can be extracted in-process without the layout service.
    pub fn has_local_extractor(self) -> bool {
        !matches!(self, FileKind::Pdf | FileKind::Other)
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FileKind::PlainText => "TXT",
            FileKind::Spreadsheet => "XLSX",
            FileKind::Delimited => "CSV",
            FileKind::Presentation => "PPTX",
            FileKind::WordProcessing => "DOCX",
            FileKind::Pdf => "PDF",
            FileKind::Other => "document",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Failed to decode text as UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("Failed to process {kind}: {reason}")]
    Format { kind: FileKind, reason: String },
    #[error("no local extractor for {0} files")]
    Unsupported(FileKind),
}

impl ExtractError {
    fn format(kind: FileKind, reason: impl fmt::Display) -> Self {
        ExtractError::Format {
            kind,
            reason: reason.to_string(),
        }
    }

    /// The format whose extractor failed, if any.
    pub fn kind(&self) -> Option<FileKind> {
        match self {
            ExtractError::Utf8(_) => Some(FileKind::PlainText),
            ExtractError::Format { kind, .. } => Some(*kind),
            ExtractError::Unsupported(_) => None,
        }
    }
}

/// Extract plain text from `bytes` using the in-process extractor for `kind`.
pub fn extract_local(bytes: &[u8], kind: FileKind) -> Result<String, ExtractError> {
    match kind {
        FileKind::PlainText => extract_txt(bytes),
        FileKind::Spreadsheet => extract_xlsx(bytes),
        FileKind::Delimited => extract_csv(bytes),
        FileKind::Presentation => extract_pptx(bytes),
        FileKind::WordProcessing => extract_docx(bytes),
        FileKind::Pdf => extract_pdf(bytes),
        FileKind::Other => Err(ExtractError::Unsupported(kind)),
    }
}

fn extract_txt(bytes: &[u8]) -> Result<String, ExtractError> {
    Ok(String::from_utf8(bytes.to_vec())?)
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::format(FileKind::Pdf, e))
}

fn extract_csv(bytes: &[u8]) -> Result<String, ExtractError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);
    let mut lines = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| ExtractError::format(FileKind::Delimited, e))?;
        lines.push(record.iter().collect::<Vec<_>>().join(CELL_SEPARATOR));
    }
    Ok(lines.join("\n"))
}

// ============ ZIP helpers ============

fn open_archive(bytes: &[u8], kind: FileKind) -> Result<OoxmlArchive<'_>, ExtractError> {
    zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| ExtractError::format(kind, e))
}

fn has_entry(archive: &OoxmlArchive<'_>, name: &str) -> bool {
    archive.file_names().any(|n| n == name)
}

fn read_zip_entry_bounded(
    archive: &mut OoxmlArchive<'_>,
    name: &str,
    kind: FileKind,
) -> Result<Vec<u8>, ExtractError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| ExtractError::format(kind, format!("{}: {}", name, e)))?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| ExtractError::format(kind, e))?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(ExtractError::format(
            kind,
            format!(
                "ZIP entry {} exceeds size limit ({} bytes)",
                name, MAX_XML_ENTRY_BYTES
            ),
        ));
    }
    Ok(out)
}

/// Entries named `{prefix}{N}.xml`, sorted by `N`.
fn numbered_entries(archive: &OoxmlArchive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

/// Value of the attribute whose local name is `local`, namespace prefix ignored.
fn attr(e: &BytesStart<'_>, local: &[u8]) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        if a.key.local_name().as_ref() == local {
            a.unescape_value().ok().map(|v| v.into_owned())
        } else {
            None
        }
    })
}

fn xml_reader(xml: &[u8]) -> quick_xml::Reader<&[u8]> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    // Whitespace inside text runs is content; only text inside known
    // elements is collected, so nothing needs trimming.
    reader.config_mut().trim_text(false);
    reader
}

// ============ Word processor ============

fn extract_docx(bytes: &[u8]) -> Result<String, ExtractError> {
    let kind = FileKind::WordProcessing;
    let mut archive = open_archive(bytes, kind)?;
    if !has_entry(&archive, "word/document.xml") {
        return Err(ExtractError::format(kind, "word/document.xml not found"));
    }
    let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", kind)?;
    docx_paragraphs(&xml).map(|paras| paras.join("\n"))
}

fn docx_paragraphs(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let kind = FileKind::WordProcessing;
    let mut reader = xml_reader(xml);
    let mut buf = Vec::new();
    let mut paragraphs = Vec::new();
    // Text boxes nest paragraphs inside runs, so open paragraphs form a stack.
    let mut open: Vec<String> = Vec::new();
    let mut in_text = false;
    let mut in_props = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"p" => open.push(String::new()),
                b"t" => in_text = true,
                b"pPr" | b"rPr" => in_props = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.local_name().as_ref() {
                b"p" => paragraphs.push(String::new()),
                b"tab" if !in_props => {
                    if let Some(p) = open.last_mut() {
                        p.push('\t');
                    }
                }
                b"br" | b"cr" => {
                    if let Some(p) = open.last_mut() {
                        p.push('\n');
                    }
                }
                _ => {}
            },
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(|e| ExtractError::format(kind, e))?;
                if let Some(p) = open.last_mut() {
                    p.push_str(&text);
                }
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"p" => {
                    if let Some(p) = open.pop() {
                        paragraphs.push(p);
                    }
                }
                b"t" => in_text = false,
                b"pPr" | b"rPr" => in_props = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::format(kind, e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(paragraphs)
}

// ============ Slide deck ============

fn extract_pptx(bytes: &[u8]) -> Result<String, ExtractError> {
    let kind = FileKind::Presentation;
    let mut archive = open_archive(bytes, kind)?;
    let slide_names = numbered_entries(&archive, "ppt/slides/slide");
    let mut lines = Vec::new();
    for name in slide_names {
        let xml = read_zip_entry_bounded(&mut archive, &name, kind)?;
        lines.extend(slide_lines(&xml)?);
    }
    Ok(lines.join("\n"))
}

/// Walks one slide, emitting shape texts and table rows in document order.
#[derive(Default)]
struct SlideWalker {
    lines: Vec<String>,
    shape_depth: usize,
    shape_paragraphs: Vec<String>,
    table_depth: usize,
    row: Vec<String>,
    cell: Option<Vec<String>>,
    paragraph: Option<String>,
    in_text: bool,
}

impl SlideWalker {
    fn start(&mut self, name: &[u8]) {
        match name {
            b"sp" => {
                if self.shape_depth == 0 {
                    self.shape_paragraphs.clear();
                }
                self.shape_depth += 1;
            }
            b"tbl" => self.table_depth += 1,
            b"tr" => self.row.clear(),
            b"tc" => self.cell = Some(Vec::new()),
            b"p" => self.paragraph = Some(String::new()),
            b"t" => self.in_text = true,
            _ => {}
        }
    }

    fn empty(&mut self, name: &[u8]) {
        match name {
            b"p" => self.finish_paragraph(String::new()),
            b"tc" => self.row.push(String::new()),
            b"br" => {
                if let Some(p) = self.paragraph.as_mut() {
                    p.push('\n');
                }
            }
            _ => {}
        }
    }

    fn text(&mut self, text: &str) {
        if self.in_text {
            if let Some(p) = self.paragraph.as_mut() {
                p.push_str(text);
            }
        }
    }

    fn end(&mut self, name: &[u8]) {
        match name {
            b"sp" => {
                self.shape_depth = self.shape_depth.saturating_sub(1);
                if self.shape_depth == 0 {
                    let text = self.shape_paragraphs.join("\n");
                    if !text.trim().is_empty() {
                        self.lines.push(text);
                    }
                    self.shape_paragraphs.clear();
                }
            }
            b"tbl" => self.table_depth = self.table_depth.saturating_sub(1),
            b"tr" => {
                if self.table_depth > 0 {
                    self.lines.push(self.row.join(CELL_SEPARATOR));
                }
                self.row.clear();
            }
            b"tc" => {
                let paragraphs = self.cell.take().unwrap_or_default();
                self.row.push(paragraphs.join("\n").trim().to_string());
            }
            b"p" => {
                if let Some(p) = self.paragraph.take() {
                    self.finish_paragraph(p);
                }
            }
            b"t" => self.in_text = false,
            _ => {}
        }
    }

    fn finish_paragraph(&mut self, paragraph: String) {
        if let Some(cell) = self.cell.as_mut() {
            cell.push(paragraph);
        } else if self.shape_depth > 0 {
            self.shape_paragraphs.push(paragraph);
        }
    }
}

fn slide_lines(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let kind = FileKind::Presentation;
    let mut reader = xml_reader(xml);
    let mut buf = Vec::new();
    let mut walker = SlideWalker::default();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => walker.start(e.local_name().as_ref()),
            Ok(Event::Empty(e)) => walker.empty(e.local_name().as_ref()),
            Ok(Event::Text(te)) => {
                let text = te.unescape().map_err(|e| ExtractError::format(kind, e))?;
                walker.text(&text);
            }
            Ok(Event::End(e)) => walker.end(e.local_name().as_ref()),
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::format(kind, e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(walker.lines)
}

// ============ Spreadsheet ============

fn extract_xlsx(bytes: &[u8]) -> Result<String, ExtractError> {
    let kind = FileKind::Spreadsheet;
    let mut archive = open_archive(bytes, kind)?;
    let shared_strings = if has_entry(&archive, "xl/sharedStrings.xml") {
        let xml = read_zip_entry_bounded(&mut archive, "xl/sharedStrings.xml", kind)?;
        read_shared_strings(&xml)?
    } else {
        Vec::new()
    };
    let sheets = list_sheets(&mut archive)?;
    if sheets.is_empty() {
        return Err(ExtractError::format(kind, "workbook contains no worksheets"));
    }

    let mut lines = Vec::new();
    for (sheet_name, path) in sheets.into_iter().take(XLSX_MAX_SHEETS) {
        let xml = read_zip_entry_bounded(&mut archive, &path, kind)?;
        lines.push(format!("--- Sheet: {} ---", sheet_name));
        for row in sheet_rows(&xml, &shared_strings)? {
            lines.push(row.join(CELL_SEPARATOR));
        }
    }
    Ok(lines.join("\n"))
}

fn read_shared_strings(xml: &[u8]) -> Result<Vec<String>, ExtractError> {
    let kind = FileKind::Spreadsheet;
    let mut reader = xml_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_si = false;
    let mut in_phonetic = false;
    let mut in_text = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"rPh" => in_phonetic = true,
                b"t" if in_si && !in_phonetic => in_text = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"si" {
                    strings.push(String::new());
                }
            }
            Ok(Event::Text(te)) if in_text => {
                let text = te.unescape().map_err(|e| ExtractError::format(kind, e))?;
                current.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
                b"rPh" => in_phonetic = false,
                b"t" => in_text = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::format(kind, e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Worksheets as `(display name, zip path)` in workbook order.
///
/// Falls back to `xl/worksheets/sheetN.xml` numbering when the workbook
/// part is missing.
fn list_sheets(archive: &mut OoxmlArchive<'_>) -> Result<Vec<(String, String)>, ExtractError> {
    let kind = FileKind::Spreadsheet;
    if !has_entry(archive, "xl/workbook.xml") {
        return Ok(numbered_entries(archive, "xl/worksheets/sheet")
            .into_iter()
            .enumerate()
            .map(|(idx, path)| (format!("Sheet{}", idx + 1), path))
            .collect());
    }

    let rels = if has_entry(archive, "xl/_rels/workbook.xml.rels") {
        let xml = read_zip_entry_bounded(archive, "xl/_rels/workbook.xml.rels", kind)?;
        workbook_relationships(&xml)?
    } else {
        HashMap::new()
    };

    let xml = read_zip_entry_bounded(archive, "xl/workbook.xml", kind)?;
    let mut reader = xml_reader(&xml);
    let mut buf = Vec::new();
    let mut sheets = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.local_name().as_ref() == b"sheet" => {
                let name = attr(&e, b"name").unwrap_or_default();
                let position = sheets.len() + 1;
                let path = attr(&e, b"id")
                    .and_then(|id| rels.get(&id).cloned())
                    .unwrap_or_else(|| format!("xl/worksheets/sheet{}.xml", position));
                sheets.push((name, path));
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::format(kind, e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(sheets)
}

/// Relationship id → zip path for the workbook part.
fn workbook_relationships(xml: &[u8]) -> Result<HashMap<String, String>, ExtractError> {
    let mut reader = xml_reader(xml);
    let mut buf = Vec::new();
    let mut rels = HashMap::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e))
                if e.local_name().as_ref() == b"Relationship" =>
            {
                if let (Some(id), Some(target)) = (attr(&e, b"Id"), attr(&e, b"Target")) {
                    let path = match target.strip_prefix('/') {
                        Some(absolute) => absolute.to_string(),
                        None => format!("xl/{}", target),
                    };
                    rels.insert(id, path);
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::format(FileKind::Spreadsheet, e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(rels)
}

/// Zero-based column index from a cell reference such as `"AB12"`.
/// References past column `XFD` are rejected.
fn column_index(cell_ref: &str) -> Result<Option<usize>, ExtractError> {
    let letters: Vec<u8> = cell_ref
        .bytes()
        .take_while(|b| b.is_ascii_alphabetic())
        .map(|b| b.to_ascii_uppercase())
        .collect();
    if letters.is_empty() {
        return Ok(None);
    }
    letters
        .iter()
        .try_fold(0usize, |acc, b| {
            acc.checked_mul(26)?.checked_add((b - b'A' + 1) as usize)
        })
        .filter(|n| *n <= XLSX_MAX_COLUMNS)
        .map(|n| Some(n - 1))
        .ok_or_else(|| {
            ExtractError::format(
                FileKind::Spreadsheet,
                format!("cell reference {} is outside the sheet", cell_ref),
            )
        })
}

/// Column of a `<c>` element: its `r` reference, or the position after the
/// previous cell when the reference is absent.
fn cell_column(e: &BytesStart<'_>, next_column: usize) -> Result<usize, ExtractError> {
    let column = match attr(e, b"r") {
        Some(r) => column_index(&r)?.unwrap_or(next_column),
        None => next_column,
    };
    if column >= XLSX_MAX_COLUMNS {
        return Err(ExtractError::format(
            FileKind::Spreadsheet,
            "row has more columns than a sheet allows",
        ));
    }
    Ok(column)
}

#[derive(Default)]
struct CellCursor {
    column: usize,
    cell_type: Option<String>,
    value: String,
    in_value: bool,
    in_inline_text: bool,
}

impl CellCursor {
    fn resolve(&self, shared_strings: &[String]) -> String {
        match self.cell_type.as_deref() {
            Some("s") => self
                .value
                .trim()
                .parse::<usize>()
                .ok()
                .and_then(|i| shared_strings.get(i).cloned())
                .unwrap_or_default(),
            Some("b") => {
                if self.value.trim() == "1" {
                    "TRUE".to_string()
                } else {
                    "FALSE".to_string()
                }
            }
            _ => self.value.clone(),
        }
    }
}

/// Rows of one worksheet, each padded to the sheet's widest row.
/// Rows with no non-empty cell are skipped.
fn sheet_rows(xml: &[u8], shared_strings: &[String]) -> Result<Vec<Vec<String>>, ExtractError> {
    let kind = FileKind::Spreadsheet;
    let mut reader = xml_reader(xml);
    let mut buf = Vec::new();
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell = CellCursor::default();
    let mut next_column = 0usize;
    let mut cell_count = 0usize;

    loop {
        if cell_count >= XLSX_MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => {
                    row.clear();
                    next_column = 0;
                }
                b"c" => {
                    cell = CellCursor {
                        column: cell_column(&e, next_column)?,
                        cell_type: attr(&e, b"t"),
                        ..CellCursor::default()
                    };
                }
                b"v" => cell.in_value = true,
                b"t" => cell.in_inline_text = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"c" {
                    next_column = cell_column(&e, next_column)? + 1;
                }
            }
            Ok(Event::Text(te)) if cell.in_value || cell.in_inline_text => {
                let text = te.unescape().map_err(|e| ExtractError::format(kind, e))?;
                cell.value.push_str(&text);
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"v" => cell.in_value = false,
                b"t" => cell.in_inline_text = false,
                b"c" => {
                    let value = cell.resolve(shared_strings);
                    if row.len() <= cell.column {
                        row.resize(cell.column + 1, String::new());
                    }
                    row[cell.column] = value;
                    next_column = cell.column + 1;
                    cell_count += 1;
                }
                b"row" => {
                    if row.iter().any(|v| !v.is_empty()) {
                        rows.push(std::mem::take(&mut row));
                    }
                    row.clear();
                }
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractError::format(kind, e)),
            _ => {}
        }
        buf.clear();
    }

    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    for row in &mut rows {
        row.resize(width, String::new());
    }
    Ok(rows)
}
