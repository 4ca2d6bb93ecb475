use std::collections::BTreeMap;

use roxmltree::{Document, Node};

use crate::domain::{FormId, MediaFileDescriptor, RemoteFormDescriptor};
use crate::error::SyncError;

pub const XFORMS_LIST_NS: &str = "http://openrosa.org/xforms/xformsList";
pub const MANIFEST_NS: &str = "http://openrosa.org/xforms/xformsManifest";

/// Parse a form-listing document. Fails closed: one entry missing a required
/// field invalidates the entire listing, never yielding a partial catalog.
pub fn parse_form_listing(
    xml: &str,
) -> Result<BTreeMap<FormId, RemoteFormDescriptor>, SyncError> {
    let doc = Document::parse(xml).map_err(|err| shape("listing", err.to_string()))?;
    let root = doc.root_element();
    require_root(root, "listing", "xforms", XFORMS_LIST_NS)?;

    let mut forms = BTreeMap::new();
    for node in root.children().filter(Node::is_element) {
        if !is_named(node, XFORMS_LIST_NS, "xform") {
            continue;
        }
        let form_id: FormId = required_text(node, "listing", "formID")?
            .parse()
            .map_err(|err: SyncError| shape("listing", err.to_string()))?;
        let name = required_text(node, "listing", "name")?.to_string();
        let hash = required_text(node, "listing", "hash")?
            .parse()
            .map_err(|err: SyncError| shape("listing", err.to_string()))?;
        let download_url = required_text(node, "listing", "downloadUrl")?.to_string();
        let version = child_text(node, "version")
            .map(|text| crate::domain::FormVersion::new(text.to_string()));
        let manifest_url = child_text(node, "manifestUrl").map(str::to_string);
        // descriptionText is advertised by some servers; nothing here uses it.

        forms.insert(
            form_id.clone(),
            RemoteFormDescriptor {
                form_id,
                name,
                version,
                hash,
                download_url,
                manifest_url,
            },
        );
    }
    Ok(forms)
}

/// Parse a media manifest. Every `mediaFile` entry must carry filename, hash,
/// and downloadUrl; a single incomplete entry invalidates the whole manifest.
pub fn parse_manifest(xml: &str) -> Result<Vec<MediaFileDescriptor>, SyncError> {
    let doc = Document::parse(xml).map_err(|err| shape("manifest", err.to_string()))?;
    let root = doc.root_element();
    require_root(root, "manifest", "manifest", MANIFEST_NS)?;

    let mut media = Vec::new();
    for node in root.children().filter(Node::is_element) {
        if !is_named(node, MANIFEST_NS, "mediaFile") {
            continue;
        }
        let filename = required_text(node, "manifest", "filename")?.to_string();
        let hash = required_text(node, "manifest", "hash")?
            .parse()
            .map_err(|err: SyncError| shape("manifest", err.to_string()))?;
        let download_url = required_text(node, "manifest", "downloadUrl")?.to_string();
        media.push(MediaFileDescriptor {
            filename,
            hash,
            download_url,
        });
    }
    Ok(media)
}

fn require_root(
    root: Node<'_, '_>,
    document: &'static str,
    name: &str,
    namespace: &str,
) -> Result<(), SyncError> {
    if root.tag_name().name() != name {
        return Err(shape(
            document,
            format!("expected root element <{name}>, got <{}>", root.tag_name().name()),
        ));
    }
    if root.tag_name().namespace() != Some(namespace) {
        return Err(shape(
            document,
            format!("root element is not in the {namespace} namespace"),
        ));
    }
    Ok(())
}

fn is_named(node: Node<'_, '_>, namespace: &str, name: &str) -> bool {
    node.tag_name().name() == name && node.tag_name().namespace() == Some(namespace)
}

fn child_text<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<&'a str> {
    node.children()
        .filter(Node::is_element)
        .find(|child| child.tag_name().name() == name)
        .and_then(|child| child.text())
        .map(str::trim)
        .filter(|text| !text.is_empty())
}

fn required_text<'a, 'input>(
    node: Node<'a, 'input>,
    document: &'static str,
    name: &str,
) -> Result<&'a str, SyncError> {
    child_text(node, name).ok_or_else(|| shape(document, format!("<{name}> missing or empty")))
}

fn shape(document: &'static str, reason: String) -> SyncError {
    SyncError::XmlShape { document, reason }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn listing_xml(entries: &str) -> String {
        format!(
            r#"<xforms xmlns="http://openrosa.org/xforms/xformsList">{entries}</xforms>"#
        )
    }

    const VALID_ENTRY: &str = r#"<xform>
        <formID>census</formID>
        <name>Census</name>
        <version>3</version>
        <hash>md5:d41d8cd98f00b204e9800998ecf8427e</hash>
        <downloadUrl>https://server/forms/census.xml</downloadUrl>
        <manifestUrl>https://server/forms/census/manifest</manifestUrl>
    </xform>"#;

    #[test]
    fn parses_complete_listing() {
        let forms = parse_form_listing(&listing_xml(VALID_ENTRY)).unwrap();
        assert_eq!(forms.len(), 1);
        let form = forms.values().next().unwrap();
        assert_eq!(form.form_id.as_str(), "census");
        assert_eq!(form.name, "Census");
        assert_eq!(form.version.as_ref().unwrap().as_str(), "3");
        assert!(form.manifest_url.is_some());
    }

    #[test]
    fn version_and_manifest_url_are_optional() {
        let entry = r#"<xform>
            <formID>census</formID>
            <name>Census</name>
            <hash>md5:d41d8cd98f00b204e9800998ecf8427e</hash>
            <downloadUrl>https://server/forms/census.xml</downloadUrl>
        </xform>"#;
        let forms = parse_form_listing(&listing_xml(entry)).unwrap();
        let form = forms.values().next().unwrap();
        assert!(form.version.is_none());
        assert!(form.manifest_url.is_none());
    }

    #[test]
    fn one_entry_missing_hash_invalidates_whole_listing() {
        let broken = r#"<xform>
            <formID>other</formID>
            <name>Other</name>
            <downloadUrl>https://server/forms/other.xml</downloadUrl>
        </xform>"#;
        let xml = listing_xml(&format!("{VALID_ENTRY}{broken}"));
        let err = parse_form_listing(&xml).unwrap_err();
        assert_matches!(err, SyncError::XmlShape { document: "listing", .. });
    }

    #[test]
    fn wrong_namespace_is_rejected() {
        let xml = r#"<xforms xmlns="http://example.org/other"></xforms>"#;
        let err = parse_form_listing(xml).unwrap_err();
        assert_matches!(err, SyncError::XmlShape { .. });
    }

    #[test]
    fn wrong_root_element_is_rejected() {
        let xml = r#"<catalog xmlns="http://openrosa.org/xforms/xformsList"></catalog>"#;
        let err = parse_form_listing(xml).unwrap_err();
        assert_matches!(err, SyncError::XmlShape { .. });
    }

    #[test]
    fn parses_manifest_entries() {
        let xml = r#"<manifest xmlns="http://openrosa.org/xforms/xformsManifest">
            <mediaFile>
                <filename>logo.png</filename>
                <hash>md5:d41d8cd98f00b204e9800998ecf8427e</hash>
                <downloadUrl>https://server/media/logo.png</downloadUrl>
            </mediaFile>
        </manifest>"#;
        let media = parse_manifest(xml).unwrap();
        assert_eq!(media.len(), 1);
        assert_eq!(media[0].filename, "logo.png");
    }

    #[test]
    fn manifest_entry_missing_download_url_fails_closed() {
        let xml = r#"<manifest xmlns="http://openrosa.org/xforms/xformsManifest">
            <mediaFile>
                <filename>logo.png</filename>
                <hash>md5:d41d8cd98f00b204e9800998ecf8427e</hash>
            </mediaFile>
        </manifest>"#;
        let err = parse_manifest(xml).unwrap_err();
        assert_matches!(err, SyncError::XmlShape { document: "manifest", .. });
    }
}
