//! Office document and PDF extraction.
//!
//! DOCX and XLSX are zip containers of XML; text comes out of
//! `word/document.xml` (`<w:t>` runs, paragraphs preserved) and the shared
//! strings plus sheet cells respectively. PDFs pass through as validated
//! base64 so the original bytes stay recoverable.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use quick_xml::Reader;
use quick_xml::events::Event;
use std::io::{Cursor, Read};
use zip::ZipArchive;

use crate::{Error, Result};

fn read_zip_entry(bytes: &[u8], entry: &str) -> Result<Option<String>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| Error::InvalidInput(format!("not a valid zip container: {e}")))?;
    let Ok(mut file) = archive.by_name(entry) else {
        return Ok(None);
    };
    let mut content = String::new();
    file.read_to_string(&mut content)
        .map_err(|e| Error::op("zip_read", format!("{entry}: {e}")))?;
    Ok(Some(content))
}

/// Extracts paragraph text from a DOCX document.
pub fn extract_docx_text(bytes: &[u8]) -> Result<String> {
    let document = read_zip_entry(bytes, "word/document.xml")?
        .ok_or_else(|| Error::InvalidInput("DOCX has no word/document.xml".to_string()))?;

    let mut reader = Reader::from_str(&document);
    let mut paragraphs: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_text_run = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(tag)) if tag.name().as_ref() == b"w:t" => {
                in_text_run = true;
            }
            Ok(Event::End(tag)) => match tag.name().as_ref() {
                b"w:t" => in_text_run = false,
                b"w:p" => {
                    if !current.trim().is_empty() {
                        paragraphs.push(current.trim().to_string());
                    }
                    current.clear();
                }
                _ => {}
            },
            Ok(Event::Text(text)) if in_text_run => {
                current.push_str(&text.unescape().unwrap_or_default());
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::InvalidInput(format!("malformed DOCX XML: {e}"))),
        }
    }
    if !current.trim().is_empty() {
        paragraphs.push(current.trim().to_string());
    }

    Ok(paragraphs.join("\n"))
}

/// Collects `<t>` strings from an XML fragment (shared strings, cells).
fn collect_tag_text(xml: &str, tag: &[u8]) -> Result<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    let mut values = Vec::new();
    let mut inside = false;
    let mut current = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) if start.name().as_ref() == tag => {
                inside = true;
                current.clear();
            }
            Ok(Event::End(end)) if end.name().as_ref() == tag => {
                inside = false;
                values.push(current.clone());
            }
            Ok(Event::Text(text)) if inside => {
                current.push_str(&text.unescape().unwrap_or_default());
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::InvalidInput(format!("malformed XLSX XML: {e}"))),
        }
    }
    Ok(values)
}

/// Extracts cell text from the first worksheet of an XLSX workbook.
///
/// Shared-string cells resolve through `xl/sharedStrings.xml`; inline and
/// numeric cells pass through as their raw value.
pub fn extract_xlsx_rows(bytes: &[u8]) -> Result<Vec<Vec<String>>> {
    let shared: Vec<String> = read_zip_entry(bytes, "xl/sharedStrings.xml")?
        .map(|xml| collect_tag_text(&xml, b"t"))
        .transpose()?
        .unwrap_or_default();

    let sheet = read_zip_entry(bytes, "xl/worksheets/sheet1.xml")?
        .ok_or_else(|| Error::InvalidInput("XLSX has no worksheets".to_string()))?;

    let mut reader = Reader::from_str(&sheet);
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut current_row: Vec<String> = Vec::new();
    let mut cell_is_shared = false;
    let mut in_value = false;
    let mut value = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(tag)) => match tag.name().as_ref() {
                b"row" => current_row.clear(),
                b"c" => {
                    cell_is_shared = tag.attributes().flatten().any(|attr| {
                        attr.key.as_ref() == b"t" && attr.value.as_ref() == b"s"
                    });
                }
                b"v" => {
                    in_value = true;
                    value.clear();
                }
                _ => {}
            },
            Ok(Event::End(tag)) => match tag.name().as_ref() {
                b"v" => {
                    in_value = false;
                    let resolved = if cell_is_shared {
                        value
                            .parse::<usize>()
                            .ok()
                            .and_then(|index| shared.get(index).cloned())
                            .unwrap_or_else(|| value.clone())
                    } else {
                        value.clone()
                    };
                    current_row.push(resolved);
                }
                b"row" => {
                    if !current_row.is_empty() {
                        rows.push(std::mem::take(&mut current_row));
                    }
                }
                _ => {}
            },
            Ok(Event::Text(text)) if in_value => {
                value.push_str(&text.unescape().unwrap_or_default());
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::InvalidInput(format!("malformed XLSX XML: {e}"))),
        }
    }

    Ok(rows)
}

/// Encodes a PDF as base64 after validating the header.
///
/// Decoding the output yields the original bytes unchanged.
pub fn process_pdf_base64(bytes: &[u8]) -> Result<String> {
    if !bytes.starts_with(b"%PDF") {
        return Err(Error::InvalidInput(
            "not a PDF: missing %PDF header".to_string(),
        ));
    }
    Ok(BASE64.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            for (name, content) in entries {
                writer
                    .start_file(*name, SimpleFileOptions::default())
                    .unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        buffer.into_inner()
    }

    #[test]
    fn test_docx_round_trip_preserves_tokens() {
        let document = r#"<?xml version="1.0"?>
            <w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
              <w:body>
                <w:p><w:r><w:t>Hello world</w:t></w:r></w:p>
                <w:p><w:r><w:t>Second paragraph</w:t><w:t> continued</w:t></w:r></w:p>
              </w:body>
            </w:document>"#;
        let bytes = build_zip(&[("word/document.xml", document)]);

        let text = extract_docx_text(&bytes).unwrap();
        for token in ["Hello", "world", "Second", "paragraph", "continued"] {
            assert!(text.contains(token), "missing token {token}");
        }
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_docx_without_document_xml_rejected() {
        let bytes = build_zip(&[("other.xml", "<x/>")]);
        assert!(extract_docx_text(&bytes).is_err());
    }

    #[test]
    fn test_xlsx_shared_and_inline_cells() {
        let shared = r#"<?xml version="1.0"?>
            <sst><si><t>Revenue</t></si><si><t>Q3</t></si></sst>"#;
        let sheet = r#"<?xml version="1.0"?>
            <worksheet>
              <sheetData>
                <row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c></row>
                <row r="2"><c r="A2"><v>1250</v></c></row>
              </sheetData>
            </worksheet>"#;
        let bytes = build_zip(&[
            ("xl/sharedStrings.xml", shared),
            ("xl/worksheets/sheet1.xml", sheet),
        ]);

        let rows = extract_xlsx_rows(&bytes).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec!["Revenue".to_string(), "Q3".to_string()]);
        assert_eq!(rows[1], vec!["1250".to_string()]);
    }

    #[test]
    fn test_pdf_base64_round_trip() {
        let original = b"%PDF-1.7\nfake pdf body\n%%EOF";
        let encoded = process_pdf_base64(original).unwrap();
        let decoded = BASE64.decode(encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_non_pdf_rejected() {
        assert!(process_pdf_base64(b"GIF89a...").is_err());
    }

    #[test]
    fn test_garbage_container_rejected() {
        assert!(extract_docx_text(b"not a zip").is_err());
        assert!(extract_xlsx_rows(b"not a zip").is_err());
    }
}
