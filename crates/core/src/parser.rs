use crate::chunking::normalize_whitespace;
use crate::error::IngestError;
use crate::models::{DocumentFormat, Page};
use lopdf::Document;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::{Cursor, Read};
use std::path::Path;

/// Decompressed-size cap per ZIP entry when reading OOXML parts.
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

pub fn detect_format(filename: &str) -> Result<DocumentFormat, IngestError> {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default();

    DocumentFormat::from_extension(extension)
        .ok_or_else(|| IngestError::UnsupportedFormat(filename.to_string()))
}

/// Parse raw file bytes into ordered, whitespace-normalized pages.
///
/// PDF and PPTX keep their page/slide boundaries; DOCX, TXT and MD come back
/// as a single page numbered 1. Pages that extract to nothing are dropped, and
/// a document with no readable text at all is an `EmptyDocument` error.
pub fn parse_document(bytes: &[u8], format: DocumentFormat) -> Result<Vec<Page>, IngestError> {
    let pages = match format {
        DocumentFormat::Pdf => parse_pdf(bytes)?,
        DocumentFormat::Docx => parse_docx(bytes)?,
        DocumentFormat::Pptx => parse_pptx(bytes)?,
        DocumentFormat::Txt | DocumentFormat::Md => parse_plain_text(bytes)?,
    };

    let pages: Vec<Page> = pages
        .into_iter()
        .map(|page| Page {
            number: page.number,
            text: normalize_whitespace(&page.text),
        })
        .filter(|page| !page.text.is_empty())
        .collect();

    if pages.is_empty() {
        return Err(IngestError::EmptyDocument(format!(
            "{} document had no readable text",
            format.as_str()
        )));
    }

    Ok(pages)
}

fn parse_pdf(bytes: &[u8]) -> Result<Vec<Page>, IngestError> {
    let document = Document::load_mem(bytes)
        .map_err(|error| IngestError::CorruptDocument(format!("pdf parse error: {error}")))?;

    let mut pages = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        let text = document
            .extract_text(&[page_no])
            .map_err(|error| IngestError::CorruptDocument(format!("pdf text error: {error}")))?;

        pages.push(Page {
            number: page_no,
            text,
        });
    }

    Ok(pages)
}

fn parse_plain_text(bytes: &[u8]) -> Result<Vec<Page>, IngestError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|error| IngestError::CorruptDocument(format!("invalid utf-8: {error}")))?;

    Ok(vec![Page {
        number: 1,
        text: text.to_string(),
    }])
}

/// DOCX body text: every `w:t` run inside `word/document.xml`, with paragraph
/// boundaries (`w:p`) turned into spaces.
fn parse_docx(bytes: &[u8]) -> Result<Vec<Page>, IngestError> {
    let mut archive = open_ooxml_archive(bytes)?;
    let xml = read_zip_entry(&mut archive, "word/document.xml")?;
    let text = collect_text_runs(&xml, b"p")?;

    Ok(vec![Page { number: 1, text }])
}

/// PPTX slides in numeric order, one page per slide.
fn parse_pptx(bytes: &[u8]) -> Result<Vec<Page>, IngestError> {
    let mut archive = open_ooxml_archive(bytes)?;

    let mut slide_names: Vec<String> = archive
        .file_names()
        .filter(|name| name.starts_with("ppt/slides/slide") && name.ends_with(".xml"))
        .map(|name| name.to_string())
        .collect();

    slide_names.sort_by_key(|name| {
        name.trim_start_matches("ppt/slides/slide")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });

    if slide_names.is_empty() {
        return Err(IngestError::CorruptDocument(
            "pptx archive has no slides".to_string(),
        ));
    }

    let mut pages = Vec::new();
    for (index, name) in slide_names.iter().enumerate() {
        let xml = read_zip_entry(&mut archive, name)?;
        let text = collect_text_runs(&xml, b"p")?;
        pages.push(Page {
            number: (index + 1) as u32,
            text,
        });
    }

    Ok(pages)
}

fn open_ooxml_archive(bytes: &[u8]) -> Result<zip::ZipArchive<Cursor<&[u8]>>, IngestError> {
    zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|error| IngestError::CorruptDocument(format!("not a zip archive: {error}")))
}

fn read_zip_entry(
    archive: &mut zip::ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Vec<u8>, IngestError> {
    let entry = archive
        .by_name(name)
        .map_err(|error| IngestError::CorruptDocument(format!("missing {name}: {error}")))?;

    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|error| IngestError::CorruptDocument(format!("unreadable {name}: {error}")))?;

    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(IngestError::CorruptDocument(format!(
            "zip entry {name} exceeds {MAX_XML_ENTRY_BYTES} bytes"
        )));
    }

    Ok(out)
}

/// Concatenate the text content of every `t` element, inserting a space at the
/// end of each `break_element` so runs don't glue together.
fn collect_text_runs(xml: &[u8], break_element: &[u8]) -> Result<String, IngestError> {
    let mut reader = Reader::from_reader(xml);

    let mut out = String::new();
    let mut in_text = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(element)) => {
                if element.local_name().as_ref() == b"t" {
                    in_text = true;
                }
            }
            Ok(Event::Text(text)) if in_text => {
                out.push_str(text.unescape().unwrap_or_default().as_ref());
            }
            Ok(Event::End(element)) => {
                let name = element.local_name();
                if name.as_ref() == b"t" {
                    in_text = false;
                } else if name.as_ref() == break_element {
                    out.push(' ');
                }
            }
            Ok(Event::Eof) => break,
            Err(error) => {
                return Err(IngestError::CorruptDocument(format!(
                    "malformed xml: {error}"
                )));
            }
            _ => {}
        }
        buf.clear();
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn zip_with_entry(name: &str, content: &str) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file(name, SimpleFileOptions::default())
            .unwrap();
        writer.write_all(content.as_bytes()).unwrap();
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn unknown_extension_is_unsupported() {
        let result = detect_format("report.xyz");
        assert!(matches!(result, Err(IngestError::UnsupportedFormat(_))));
    }

    #[test]
    fn extension_detection_is_case_insensitive() {
        assert_eq!(detect_format("Notes.MD").unwrap(), DocumentFormat::Md);
        assert_eq!(detect_format("deck.PPTX").unwrap(), DocumentFormat::Pptx);
    }

    #[test]
    fn txt_parses_as_single_page_one() {
        let pages = parse_document(b"hello   world\nagain", DocumentFormat::Txt).unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].number, 1);
        assert_eq!(pages[0].text, "hello world again");
    }

    #[test]
    fn empty_txt_is_empty_document() {
        let result = parse_document(b"   \n\t ", DocumentFormat::Txt);
        assert!(matches!(result, Err(IngestError::EmptyDocument(_))));
    }

    #[test]
    fn invalid_utf8_txt_is_corrupt() {
        let result = parse_document(&[0xff, 0xfe, 0x00], DocumentFormat::Txt);
        assert!(matches!(result, Err(IngestError::CorruptDocument(_))));
    }

    #[test]
    fn broken_pdf_is_corrupt() {
        let result = parse_document(b"%PDF-1.4 not really", DocumentFormat::Pdf);
        assert!(matches!(result, Err(IngestError::CorruptDocument(_))));
    }

    #[test]
    fn non_zip_docx_is_corrupt() {
        let result = parse_document(b"plainly not a zip", DocumentFormat::Docx);
        assert!(matches!(result, Err(IngestError::CorruptDocument(_))));
    }

    #[test]
    fn docx_paragraph_runs_are_concatenated() {
        let xml = r#"<?xml version="1.0"?>
            <w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
              <w:body>
                <w:p><w:r><w:t>First paragraph.</w:t></w:r></w:p>
                <w:p><w:r><w:t>Second</w:t></w:r><w:r><w:t xml:space="preserve"> half.</w:t></w:r></w:p>
              </w:body>
            </w:document>"#;
        let bytes = zip_with_entry("word/document.xml", xml);

        let pages = parse_document(&bytes, DocumentFormat::Docx).unwrap();
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].text, "First paragraph. Second half.");
    }

    #[test]
    fn pptx_slides_become_ordered_pages() {
        let slide = |text: &str| {
            format!(
                r#"<p:sld xmlns:a="http://schemas.openxmlformats.org/drawingml/2006/main"
                        xmlns:p="http://schemas.openxmlformats.org/presentationml/2006/main">
                     <a:t>{text}</a:t>
                   </p:sld>"#
            )
        };

        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, text) in [
            ("ppt/slides/slide2.xml", "Second slide"),
            ("ppt/slides/slide1.xml", "Opening slide"),
        ] {
            writer
                .start_file(name, SimpleFileOptions::default())
                .unwrap();
            writer.write_all(slide(text).as_bytes()).unwrap();
        }
        let bytes = writer.finish().unwrap().into_inner();

        let pages = parse_document(&bytes, DocumentFormat::Pptx).unwrap();
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].number, 1);
        assert_eq!(pages[0].text, "Opening slide");
        assert_eq!(pages[1].number, 2);
        assert_eq!(pages[1].text, "Second slide");
    }
}
