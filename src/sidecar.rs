//! XMP sidecar export and import.
//!
//! Sidecars are written next to originals as `<file>.xmp` and carry the
//! user-editable fields (title, caption, tags, rating). The catalog
//! database stays the source of truth; sidecars exist for interchange with
//! other tools.

use anyhow::Result;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::db::CatalogDb;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SidecarData {
    pub title: Option<String>,
    pub caption: Option<String>,
    pub rating: Option<i64>,
    pub tags: Vec<String>,
}

/// Sidecar path for a media file: the full name plus `.xmp`.
pub fn sidecar_path(photo_path: &Path) -> PathBuf {
    let mut name = photo_path.as_os_str().to_os_string();
    name.push(".xmp");
    PathBuf::from(name)
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

/// Serialize to an XMP packet.
pub fn render_xmp(data: &SidecarData) -> String {
    let mut body = String::new();
    if let Some(title) = &data.title {
        body.push_str(&format!(
            "   <dc:title><rdf:Alt><rdf:li xml:lang=\"x-default\">{}</rdf:li></rdf:Alt></dc:title>\n",
            xml_escape(title)
        ));
    }
    if let Some(caption) = &data.caption {
        body.push_str(&format!(
            "   <dc:description><rdf:Alt><rdf:li xml:lang=\"x-default\">{}</rdf:li></rdf:Alt></dc:description>\n",
            xml_escape(caption)
        ));
    }
    if !data.tags.is_empty() {
        body.push_str("   <dc:subject><rdf:Bag>\n");
        for tag in &data.tags {
            body.push_str(&format!("    <rdf:li>{}</rdf:li>\n", xml_escape(tag)));
        }
        body.push_str("   </rdf:Bag></dc:subject>\n");
    }

    let rating_attr = data
        .rating
        .map(|r| format!("\n    xmp:Rating=\"{r}\""))
        .unwrap_or_default();

    format!(
        "<?xpacket begin=\"\" id=\"W5M0MpCehiHzreSzNTczkc9d\"?>\n\
         <x:xmpmeta xmlns:x=\"adobe:ns:meta/\">\n\
         \x20<rdf:RDF xmlns:rdf=\"http://www.w3.org/1999/02/22-rdf-syntax-ns#\">\n\
         \x20 <rdf:Description rdf:about=\"\"\n\
         \x20   xmlns:dc=\"http://purl.org/dc/elements/1.1/\"\n\
         \x20   xmlns:xmp=\"http://ns.adobe.com/xap/1.0/\"{rating_attr}>\n\
         {body}\
         \x20 </rdf:Description>\n\
         \x20</rdf:RDF>\n\
         </x:xmpmeta>\n\
         <?xpacket end=\"w\"?>\n"
    )
}

fn regexes() -> &'static (Regex, Regex, Regex, Regex, Regex) {
    static RE: OnceLock<(Regex, Regex, Regex, Regex, Regex)> = OnceLock::new();
    RE.get_or_init(|| {
        (
            Regex::new(r#"xmp:Rating="(-?\d+)""#).unwrap(),
            Regex::new(r"(?s)<dc:title>.*?<rdf:li[^>]*>(.*?)</rdf:li>").unwrap(),
            Regex::new(r"(?s)<dc:description>.*?<rdf:li[^>]*>(.*?)</rdf:li>").unwrap(),
            Regex::new(r"(?s)<dc:subject>(.*?)</dc:subject>").unwrap(),
            Regex::new(r"<rdf:li>([^<]*)</rdf:li>").unwrap(),
        )
    })
}

/// Parse an XMP packet. Unknown fields are ignored.
pub fn parse_xmp(content: &str) -> SidecarData {
    let (rating_re, title_re, description_re, subject_re, li_re) = regexes();

    let mut data = SidecarData::default();
    if let Some(caps) = rating_re.captures(content) {
        data.rating = caps[1].parse().ok();
    }
    if let Some(caps) = title_re.captures(content) {
        data.title = Some(xml_unescape(caps[1].trim()));
    }
    if let Some(caps) = description_re.captures(content) {
        data.caption = Some(xml_unescape(caps[1].trim()));
    }
    if let Some(caps) = subject_re.captures(content) {
        data.tags = li_re
            .captures_iter(&caps[1])
            .map(|c| xml_unescape(c[1].trim()))
            .filter(|t| !t.is_empty())
            .collect();
    }
    data
}

pub fn write_sidecar(photo_path: &Path, data: &SidecarData) -> Result<PathBuf> {
    let path = sidecar_path(photo_path);
    std::fs::write(&path, render_xmp(data))?;
    Ok(path)
}

pub fn read_sidecar(photo_path: &Path) -> Result<Option<SidecarData>> {
    let path = sidecar_path(photo_path);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    Ok(Some(parse_xmp(&content)))
}

/// Export a photo's user-editable fields to its sidecar.
pub fn export_photo(db: &CatalogDb, photo_id: i64) -> Result<Option<PathBuf>> {
    let Some(photo) = db.photo_by_id(photo_id)? else {
        return Ok(None);
    };
    let tags = db
        .tags_for_photo(photo_id)?
        .into_iter()
        .map(|t| t.name)
        .collect();
    let data = SidecarData {
        title: photo.title,
        caption: photo.caption,
        rating: photo.rating,
        tags,
    };
    let path = write_sidecar(Path::new(&photo.path), &data)?;
    Ok(Some(path))
}

/// Apply a photo's sidecar back onto the catalog row. Returns false when no
/// sidecar exists.
pub fn import_photo(db: &CatalogDb, photo_id: i64) -> Result<bool> {
    let Some(photo) = db.photo_by_id(photo_id)? else {
        return Ok(false);
    };
    let Some(data) = read_sidecar(Path::new(&photo.path))? else {
        return Ok(false);
    };

    db.set_user_fields(
        photo_id,
        data.title.as_deref(),
        data.caption.as_deref(),
        data.rating,
    )?;
    for tag in &data.tags {
        let tag_id = db.ensure_tag(tag, photo.project_id)?;
        db.add_tag_to_photo(photo_id, tag_id)?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_util::{make_project, open_temp};

    #[test]
    fn test_render_parse_round_trip() {
        let data = SidecarData {
            title: Some("Beach <Day>".to_string()),
            caption: Some("Sand & sun \"2024\"".to_string()),
            rating: Some(4),
            tags: vec!["holiday".to_string(), "family & friends".to_string()],
        };
        let parsed = parse_xmp(&render_xmp(&data));
        assert_eq!(parsed, data);
    }

    #[test]
    fn test_parse_empty_packet() {
        let parsed = parse_xmp(&render_xmp(&SidecarData::default()));
        assert_eq!(parsed, SidecarData::default());
    }

    #[test]
    fn test_export_then_import_is_identity() {
        let (dir, db) = open_temp();
        let project = make_project(&db, "p");
        let folder = db.ensure_folder(project, "/lib", "lib", None).unwrap();
        let photo_path = dir.path().join("img.jpg");
        std::fs::write(&photo_path, b"jpeg-bytes").unwrap();

        let photo = db
            .upsert_photo(&photo_path, folder, project, None, None, None, None, None, &[])
            .unwrap();
        db.set_user_fields(photo, Some("Title"), Some("Caption"), Some(5))
            .unwrap();
        let tag = db.ensure_tag("sunset", project).unwrap();
        db.add_tag_to_photo(photo, tag).unwrap();

        export_photo(&db, photo).unwrap().unwrap();

        // Wipe the fields, then re-import from the sidecar.
        db.set_user_fields(photo, None, None, None).unwrap();
        db.remove_tag_from_photo(photo, tag).unwrap();
        assert!(import_photo(&db, photo).unwrap());

        let row = db.photo_by_id(photo).unwrap().unwrap();
        assert_eq!(row.title.as_deref(), Some("Title"));
        assert_eq!(row.caption.as_deref(), Some("Caption"));
        assert_eq!(row.rating, Some(5));
        let tags = db.tags_for_photo(photo).unwrap();
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].name, "sunset");
    }
}
