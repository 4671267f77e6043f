use std::io::{Cursor, Read};
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use calamine::{open_workbook_auto_from_rs, Data, Reader};
use zip::ZipArchive;

use super::extract::ExtractionError;
use crate::providers::InlineImage;

#[derive(Debug, Clone, PartialEq)]
pub struct SheetData {
    pub name: String,
    /// Rendered cell values. `rows[0][0]` sits at `origin`.
    pub rows: Vec<Vec<String>>,
    /// Zero-based (row, column) of the first cell in the used range.
    pub origin: (u32, u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetCell {
    pub sheet: String,
    pub column: String,
    pub row: u32,
    pub address: String,
    pub text: String,
}

pub fn read_workbook(bytes: Vec<u8>) -> Result<Vec<SheetData>, ExtractionError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|error| ExtractionError::Spreadsheet(error.to_string()))?;

    let mut sheets = Vec::new();
    for name in workbook.sheet_names() {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|error| ExtractionError::Spreadsheet(format!("sheet {name}: {error}")))?;
        let origin = range.start().unwrap_or((0, 0));
        let rows = range
            .rows()
            .map(|row| row.iter().map(render_cell).collect())
            .collect();
        sheets.push(SheetData { name, rows, origin });
    }
    Ok(sheets)
}

pub fn read_workbook_file(path: &Path) -> Result<Vec<SheetData>, ExtractionError> {
    read_workbook(std::fs::read(path)?)
}

fn render_cell(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        other => other.to_string(),
    }
}

/// Base-26 column letters: 1 -> A, 26 -> Z, 27 -> AA.
pub fn column_letter(column: u32) -> String {
    let mut column = column;
    let mut letters = Vec::new();
    while column > 0 {
        let rem = ((column - 1) % 26) as u8;
        letters.push((b'A' + rem) as char);
        column = (column - 1) / 26;
    }
    letters.iter().rev().collect()
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Every sheet as `Sheet: {name}` followed by CSV rows.
pub fn workbook_text(sheets: &[SheetData]) -> String {
    sheets
        .iter()
        .filter(|sheet| !sheet.rows.is_empty())
        .map(|sheet| {
            let csv = sheet
                .rows
                .iter()
                .map(|row| row.iter().map(|cell| csv_field(cell)).collect::<Vec<_>>().join(","))
                .collect::<Vec<_>>()
                .join("\n");
            format!("Sheet: {}\n{}", sheet.name, csv)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn workbook_cells(sheets: &[SheetData]) -> Vec<SheetCell> {
    let mut cells = Vec::new();
    for sheet in sheets {
        let (row_origin, column_origin) = sheet.origin;
        for (row_offset, row) in sheet.rows.iter().enumerate() {
            for (column_offset, value) in row.iter().enumerate() {
                let text = value.trim();
                if text.is_empty() {
                    continue;
                }
                let row_number = row_origin + row_offset as u32 + 1;
                let column = column_letter(column_origin + column_offset as u32 + 1);
                cells.push(SheetCell {
                    sheet: sheet.name.clone(),
                    address: format!("{}!{}{}", sheet.name, column, row_number),
                    column,
                    row: row_number,
                    text: text.to_string(),
                });
            }
        }
    }
    cells
}

/// Prompt rendering: `Sheet: {name}` then numbered, comma-joined rows.
pub fn format_workbook_context(sheets: &[SheetData]) -> String {
    sheets
        .iter()
        .map(|sheet| {
            let rows = sheet
                .rows
                .iter()
                .filter(|row| row.iter().any(|cell| !cell.trim().is_empty()))
                .enumerate()
                .map(|(index, row)| format!("   {}. {}", index + 1, row.join(", ")))
                .collect::<Vec<_>>()
                .join("\n");
            format!("Sheet: {}\n{}", sheet.name, rows)
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Images embedded in an xlsx package (`xl/media/*`).
pub fn workbook_images(bytes: &[u8]) -> Result<Vec<InlineImage>, ExtractionError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|error| ExtractionError::Spreadsheet(format!("open xlsx package: {error}")))?;

    let mut images = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|error| ExtractionError::Spreadsheet(format!("read xlsx entry: {error}")))?;
        let name = entry.name().to_ascii_lowercase();
        if !name.starts_with("xl/media/") {
            continue;
        }
        let mime_type = match name.rsplit('.').next() {
            Some("png") => "image/png",
            Some("jpg" | "jpeg") => "image/jpeg",
            Some("gif") => "image/gif",
            Some("bmp") => "image/bmp",
            Some("webp") => "image/webp",
            _ => continue,
        };
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        images.push(InlineImage {
            mime_type: mime_type.to_string(),
            data: STANDARD.encode(&data),
            description: None,
        });
    }
    Ok(images)
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    use super::{column_letter, format_workbook_context, workbook_cells, workbook_images, workbook_text, SheetData};

    fn sample() -> Vec<SheetData> {
        vec![SheetData {
            name: "Árlista".to_string(),
            rows: vec![
                vec!["Termék".to_string(), "Ár".to_string()],
                vec!["Tea, zöld".to_string(), "1200".to_string()],
                vec![String::new(), String::new()],
            ],
            origin: (1, 1),
        }]
    }

    #[test]
    fn column_letters_are_base26() {
        assert_eq!(column_letter(1), "A");
        assert_eq!(column_letter(26), "Z");
        assert_eq!(column_letter(27), "AA");
        assert_eq!(column_letter(703), "AAA");
    }

    #[test]
    fn cells_respect_range_origin_and_skip_blanks() {
        let cells = workbook_cells(&sample());
        assert_eq!(cells.len(), 4);
        assert_eq!(cells[0].address, "Árlista!B2");
        assert_eq!(cells[3].column, "C");
        assert_eq!(cells[3].row, 3);
        assert_eq!(cells[3].text, "1200");
    }

    #[test]
    fn text_and_context_renderings() {
        let text = workbook_text(&sample());
        assert!(text.starts_with("Sheet: Árlista\nTermék,Ár\n\"Tea, zöld\",1200"));

        let context = format_workbook_context(&sample());
        assert_eq!(context, "Sheet: Árlista\n   1. Termék, Ár\n   2. Tea, zöld, 1200");
    }

    #[test]
    fn media_entries_become_images() {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = ZipWriter::new(&mut buffer);
            let options = SimpleFileOptions::default();
            writer.start_file("xl/media/image1.png", options).expect("start png");
            writer.write_all(&[0x89, 0x50, 0x4e, 0x47]).expect("write png");
            writer.start_file("xl/workbook.xml", options).expect("start xml");
            writer.write_all(b"<workbook/>").expect("write xml");
            writer.finish().expect("finish zip");
        }

        let images = workbook_images(buffer.get_ref()).expect("read images");
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].mime_type, "image/png");
        assert_eq!(images[0].data, "iVBORw==");
    }
}
