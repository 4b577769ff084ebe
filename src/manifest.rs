use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;
use std::io::{Cursor, Read};
use thiserror::Error;

use crate::models::ScormVersion;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedManifest {
    pub default_launch: String,
    // (sco_identifier, href, parameters)
    pub scos: Vec<(String, String, Option<String>)>,
    pub title: Option<String>,
    pub scorm_version: Option<ScormVersion>,
}

/// What an upload needs to know about a package before sending it.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageInfo {
    pub size: u64,
    pub manifest_path: String,
    pub manifest: ParsedManifest,
}

#[derive(Error, Debug)]
pub enum PackageError {
    #[error("package is {size} bytes, limit is {max}")]
    TooLarge { size: u64, max: u64 },
    #[error("package is not a valid zip archive")]
    NotZip,
    #[error("imsmanifest.xml not found")]
    MissingManifest,
    #[error("failed to parse manifest")]
    Parse,
}

/// Validates an archive in memory: size limit, zip structure, manifest present and parseable.
pub fn inspect_package(bytes: &[u8], max_bytes: u64) -> Result<PackageInfo, PackageError> {
    let size = bytes.len() as u64;
    if size > max_bytes {
        return Err(PackageError::TooLarge { size, max: max_bytes });
    }

    let mut zip = zip::ZipArchive::new(Cursor::new(bytes)).map_err(|_| PackageError::NotZip)?;
    let manifest_path = find_manifest(&zip).ok_or(PackageError::MissingManifest)?;

    let mut xml = String::new();
    zip.by_name(&manifest_path)
        .map_err(|_| PackageError::MissingManifest)?
        .read_to_string(&mut xml)
        .map_err(|_| PackageError::Parse)?;

    Ok(PackageInfo {
        size,
        manifest_path,
        manifest: parse_manifest(&xml)?,
    })
}

// The shallowest imsmanifest.xml wins; some tools wrap the package in a folder.
fn find_manifest<R: Read + std::io::Seek>(zip: &zip::ZipArchive<R>) -> Option<String> {
    zip.file_names()
        .filter(|n| {
            let leaf = n.rsplit('/').next().unwrap_or(n);
            leaf.eq_ignore_ascii_case("imsmanifest.xml")
        })
        .min_by_key(|n| n.matches('/').count())
        .map(str::to_string)
}

#[derive(Default, Debug, Clone)]
struct ResourceInfo {
    href: Option<String>,
    files: Vec<String>,
}

#[derive(PartialEq)]
enum TextTarget {
    None,
    OrgTitle,
    SchemaVersion,
}

pub fn parse_manifest(xml: &str) -> Result<ParsedManifest, PackageError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut buf = Vec::new();

    // resources: resource identifier -> info
    let mut resources: HashMap<String, ResourceInfo> = HashMap::new();

    // items collected: (identifier, identifierref, parameters)
    let mut items: Vec<(String, String, Option<String>)> = Vec::new();

    let mut current_res_id: Option<String> = None;

    let mut default_org_id: Option<String> = None;
    let mut current_org_id: Option<String> = None;
    let mut item_depth = 0usize;

    let mut first_item_ref_in_default_org: Option<String> = None;
    let mut first_item_ref_any: Option<String> = None;

    let mut title: Option<String> = None;
    let mut scorm_version: Option<ScormVersion> = None;
    let mut text_target = TextTarget::None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                match local_name(&e).as_str() {
                    "organizations" => default_org_id = get_attr(&e, "default"),
                    "organization" => current_org_id = get_attr(&e, "identifier"),
                    "title" if current_org_id.is_some() && item_depth == 0 && title.is_none() => {
                        text_target = TextTarget::OrgTitle;
                    }
                    "schemaversion" => text_target = TextTarget::SchemaVersion,
                    "item" => {
                        item_depth += 1;
                        record_item(
                            &e,
                            &default_org_id,
                            &current_org_id,
                            &mut items,
                            &mut first_item_ref_any,
                            &mut first_item_ref_in_default_org,
                        );
                    }
                    "resource" => {
                        if let Some(id) = record_resource(&e, &mut resources) {
                            current_res_id = Some(id);
                        }
                    }
                    "file" => record_file(&e, &current_res_id, &mut resources),
                    _ => {}
                }
            }
            Ok(Event::Empty(e)) => match local_name(&e).as_str() {
                "item" => record_item(
                    &e,
                    &default_org_id,
                    &current_org_id,
                    &mut items,
                    &mut first_item_ref_any,
                    &mut first_item_ref_in_default_org,
                ),
                "resource" => {
                    record_resource(&e, &mut resources);
                }
                "file" => record_file(&e, &current_res_id, &mut resources),
                _ => {}
            },
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(|_| PackageError::Parse)?;
                match text_target {
                    TextTarget::OrgTitle => title = Some(text.trim().to_string()),
                    TextTarget::SchemaVersion => scorm_version = text.parse().ok(),
                    TextTarget::None => {}
                }
            }
            Ok(Event::End(e)) => {
                text_target = TextTarget::None;
                let name = String::from_utf8_lossy(e.name().as_ref()).to_string();
                let name = name.split(':').last().unwrap_or(&name);
                match name {
                    "organization" => current_org_id = None,
                    "item" => item_depth = item_depth.saturating_sub(1),
                    "resource" => current_res_id = None,
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return Err(PackageError::Parse),
            _ => {}
        }
        buf.clear();
    }

    let chosen_item_ref = first_item_ref_in_default_org
        .or(first_item_ref_any)
        .or_else(|| first_resource_href(&resources))
        .ok_or(PackageError::Parse)?;

    let default_launch = resolve_launch_href(&resources, &chosen_item_ref)
        .or_else(|| first_resource_href(&resources))
        .ok_or(PackageError::Parse)?;

    let scos = items
        .into_iter()
        .filter_map(|(ident, identifierref, params)| {
            resolve_launch_href(&resources, &identifierref).map(|href| (ident, href, params))
        })
        .collect();

    Ok(ParsedManifest {
        default_launch,
        scos,
        title: title.filter(|t| !t.is_empty()),
        scorm_version,
    })
}

// ------------- helpers -------------

fn record_item(
    e: &BytesStart<'_>,
    default_org_id: &Option<String>,
    current_org_id: &Option<String>,
    items: &mut Vec<(String, String, Option<String>)>,
    first_any: &mut Option<String>,
    first_in_default: &mut Option<String>,
) {
    let (Some(id), Some(iref)) = (get_attr(e, "identifier"), get_attr(e, "identifierref")) else {
        return;
    };
    if first_any.is_none() {
        *first_any = Some(iref.clone());
    }
    // with no default declared, the first organization counts as default
    let is_default_org = match (default_org_id, current_org_id) {
        (Some(def), Some(cur)) => def == cur,
        (None, Some(_)) => true,
        _ => false,
    };
    if is_default_org && first_in_default.is_none() {
        *first_in_default = Some(iref.clone());
    }
    items.push((id, iref, get_attr(e, "parameters")));
}

fn record_resource(
    e: &BytesStart<'_>,
    resources: &mut HashMap<String, ResourceInfo>,
) -> Option<String> {
    let id = get_attr(e, "identifier")?;
    let info = resources.entry(id.clone()).or_default();
    if let Some(h) = get_attr(e, "href") {
        info.href = Some(h);
    }
    Some(id)
}

fn record_file(
    e: &BytesStart<'_>,
    current_res_id: &Option<String>,
    resources: &mut HashMap<String, ResourceInfo>,
) {
    if let (Some(res_id), Some(href)) = (current_res_id.clone(), get_attr(e, "href")) {
        resources.entry(res_id).or_default().files.push(href);
    }
}

fn local_name(tag: &BytesStart<'_>) -> String {
    let full = String::from_utf8_lossy(tag.name().as_ref()).to_string();
    full.split(':').last().unwrap_or(&full).to_string()
}

fn get_attr(e: &BytesStart<'_>, key_local: &str) -> Option<String> {
    for a in e.attributes().flatten() {
        let key = std::str::from_utf8(a.key.as_ref()).unwrap_or_default();
        let key = key.split(':').last().unwrap_or(key);
        if key == key_local {
            return Some(a.unescape_value().ok()?.into_owned());
        }
    }
    None
}

fn resolve_launch_href(
    resources: &HashMap<String, ResourceInfo>,
    identifierref: &str,
) -> Option<String> {
    let r = resources.get(identifierref)?;
    if let Some(h) = &r.href {
        return Some(h.clone());
    }
    r.files.first().cloned()
}

fn first_resource_href(resources: &HashMap<String, ResourceInfo>) -> Option<String> {
    let mut ids: Vec<&String> = resources.keys().collect();
    ids.sort();
    ids.into_iter().find_map(|id| {
        let r = &resources[id];
        r.href.clone().or_else(|| r.files.first().cloned())
    })
}
