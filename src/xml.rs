//! S3 XML response rendering.
//!
//! All S3 API responses are XML-encoded.  This module provides helpers
//! that produce the correct XML payloads using `quick-xml`, plus a
//! reader for the `<Error>` envelope.

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;

const S3_XMLNS: &str = "http://s3.amazonaws.com/doc/2006-03-01/";

// ── Error response ──────────────────────────────────────────────────

/// Render an S3 `<Error>` XML document.
///
/// ```xml
/// <?xml version="1.0" encoding="UTF-8"?>
/// <Error>
///   <Code>NoSuchKey</Code>
///   <Message>The specified key does not exist.</Message>
///   <Resource>/s3/mybucket/photo.jpg</Resource>
///   <RequestId>4F2A9C0D1E3B5A7C</RequestId>
/// </Error>
/// ```
pub fn render_error(code: &str, message: &str, resource: &str, request_id: &str) -> String {
    let mut writer = new_document();

    write_simple_element_group(
        &mut writer,
        "Error",
        &[
            ("Code", code),
            ("Message", message),
            ("Resource", resource),
            ("RequestId", request_id),
        ],
    );

    finish(writer)
}

/// Fields of a parsed `<Error>` document.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ErrorDocument {
    pub code: String,
    pub message: String,
    pub resource: String,
    pub request_id: String,
}

/// Parse an `<Error>` document. Returns `None` if it is not well-formed
/// or carries no `Code`.
pub fn parse_error(body: &str) -> Option<ErrorDocument> {
    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut doc = ErrorDocument::default();
    let mut current_tag = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                current_tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
            }
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().ok()?.to_string();
                match current_tag.as_str() {
                    "Code" => doc.code = text,
                    "Message" => doc.message = text,
                    "Resource" => doc.resource = text,
                    "RequestId" => doc.request_id = text,
                    _ => {}
                }
            }
            Ok(Event::End(_)) => current_tag.clear(),
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
        buf.clear();
    }

    (!doc.code.is_empty()).then_some(doc)
}

// ── DeleteResult ────────────────────────────────────────────────────

/// Represents a single error in a DeleteObjects response.
pub struct DeleteErrorEntry<'a> {
    pub key: &'a str,
    pub code: &'a str,
    pub message: &'a str,
}

/// Render `<DeleteResult>` for batch DeleteObjects.
///
/// In quiet mode successful deletions are omitted.
pub fn render_delete_result(
    deleted: &[&str],
    errors: &[DeleteErrorEntry<'_>],
    quiet: bool,
) -> String {
    let mut writer = new_document();
    start_root(&mut writer, "DeleteResult");

    if !quiet {
        for key in deleted {
            write_simple_element_group(&mut writer, "Deleted", &[("Key", key)]);
        }
    }

    for entry in errors {
        write_simple_element_group(
            &mut writer,
            "Error",
            &[
                ("Key", entry.key),
                ("Code", entry.code),
                ("Message", entry.message),
            ],
        );
    }

    end_root(&mut writer, "DeleteResult");
    finish(writer)
}

// ── Copy results ────────────────────────────────────────────────────

/// Render `<CopyObjectResult>` returned by `PUT` with `x-amz-copy-source`.
pub fn render_copy_object_result(etag: &str, last_modified: &str) -> String {
    render_copy_result("CopyObjectResult", etag, last_modified)
}

/// Render `<CopyPartResult>` returned by UploadPartCopy.
pub fn render_copy_part_result(etag: &str, last_modified: &str) -> String {
    render_copy_result("CopyPartResult", etag, last_modified)
}

fn render_copy_result(root: &str, etag: &str, last_modified: &str) -> String {
    let mut writer = new_document();
    start_root(&mut writer, root);
    write_text_element(&mut writer, "ETag", etag);
    write_text_element(&mut writer, "LastModified", last_modified);
    end_root(&mut writer, root);
    finish(writer)
}

// ── Multipart ───────────────────────────────────────────────────────

/// Render `<InitiateMultipartUploadResult>`.
pub fn render_initiate_multipart_upload_result(bucket: &str, key: &str, upload_id: &str) -> String {
    let mut writer = new_document();
    start_root(&mut writer, "InitiateMultipartUploadResult");
    write_text_element(&mut writer, "Bucket", bucket);
    write_text_element(&mut writer, "Key", key);
    write_text_element(&mut writer, "UploadId", upload_id);
    end_root(&mut writer, "InitiateMultipartUploadResult");
    finish(writer)
}

/// Render `<CompleteMultipartUploadResult>`.
pub fn render_complete_multipart_upload_result(
    location: &str,
    bucket: &str,
    key: &str,
    etag: &str,
) -> String {
    let mut writer = new_document();
    start_root(&mut writer, "CompleteMultipartUploadResult");
    write_text_element(&mut writer, "Location", location);
    write_text_element(&mut writer, "Bucket", bucket);
    write_text_element(&mut writer, "Key", key);
    write_text_element(&mut writer, "ETag", etag);
    end_root(&mut writer, "CompleteMultipartUploadResult");
    finish(writer)
}

/// Represents a single part entry in the ListParts response.
pub struct PartEntry<'a> {
    pub part_number: u32,
    pub last_modified: &'a str,
    pub etag: &'a str,
    pub size: u64,
}

/// Pagination header of a ListParts response.
pub struct ListPartsPage<'a> {
    pub bucket: &'a str,
    pub key: &'a str,
    pub upload_id: &'a str,
    pub part_number_marker: u32,
    pub next_part_number_marker: Option<u32>,
    pub max_parts: u32,
    pub is_truncated: bool,
}

/// Render `<ListPartsResult>` for ListParts.
pub fn render_list_parts_result(page: &ListPartsPage<'_>, parts: &[PartEntry<'_>]) -> String {
    let mut writer = new_document();
    start_root(&mut writer, "ListPartsResult");

    write_text_element(&mut writer, "Bucket", page.bucket);
    write_text_element(&mut writer, "Key", page.key);
    write_text_element(&mut writer, "UploadId", page.upload_id);
    write_text_element(&mut writer, "StorageClass", "STANDARD");
    write_text_element(
        &mut writer,
        "PartNumberMarker",
        &page.part_number_marker.to_string(),
    );
    if let Some(next) = page.next_part_number_marker {
        write_text_element(&mut writer, "NextPartNumberMarker", &next.to_string());
    }
    write_text_element(&mut writer, "MaxParts", &page.max_parts.to_string());
    write_text_element(
        &mut writer,
        "IsTruncated",
        if page.is_truncated { "true" } else { "false" },
    );

    for part in parts {
        writer
            .write_event(Event::Start(BytesStart::new("Part")))
            .expect("start Part");
        write_text_element(&mut writer, "PartNumber", &part.part_number.to_string());
        write_text_element(&mut writer, "LastModified", part.last_modified);
        write_text_element(&mut writer, "ETag", part.etag);
        write_text_element(&mut writer, "Size", &part.size.to_string());
        writer
            .write_event(Event::End(BytesEnd::new("Part")))
            .expect("end Part");
    }

    end_root(&mut writer, "ListPartsResult");
    finish(writer)
}

// ── Helpers ─────────────────────────────────────────────────────────

type XmlWriter = Writer<Cursor<Vec<u8>>>;

fn new_document() -> XmlWriter {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .expect("xml decl");
    writer
}

fn finish(writer: XmlWriter) -> String {
    String::from_utf8(writer.into_inner().into_inner()).expect("valid utf-8")
}

fn start_root(writer: &mut XmlWriter, name: &str) {
    let root = BytesStart::new(name).with_attributes([("xmlns", S3_XMLNS)]);
    writer.write_event(Event::Start(root)).expect("start root");
}

fn end_root(writer: &mut XmlWriter, name: &str) {
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .expect("end root");
}

/// Write a `<tag>text</tag>` element.
fn write_text_element(writer: &mut XmlWriter, tag: &str, text: &str) {
    writer
        .write_event(Event::Start(BytesStart::new(tag)))
        .expect("start tag");
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .expect("text");
    writer
        .write_event(Event::End(BytesEnd::new(tag)))
        .expect("end tag");
}

/// Write a parent element containing a flat list of child text elements.
fn write_simple_element_group(writer: &mut XmlWriter, parent: &str, children: &[(&str, &str)]) {
    writer
        .write_event(Event::Start(BytesStart::new(parent)))
        .expect("start parent");
    for (tag, value) in children {
        write_text_element(writer, tag, value);
    }
    writer
        .write_event(Event::End(BytesEnd::new(parent)))
        .expect("end parent");
}
