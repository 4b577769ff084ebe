//! Launch settings and the signed preview fallback.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::{json, Value};
use sha2::Sha256;

use super::error::CloudError;

type HmacSha256 = Hmac<Sha256>;

/// RFC 3986 unreserved characters pass through, everything else is escaped.
pub(crate) const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub(crate) fn encode(s: &str) -> String {
    utf8_percent_encode(s, COMPONENT).to_string()
}

/// Same tab, API at the top window, frameset player.
pub fn default_settings() -> Value {
    json!({
        "expiry": 0,
        "tracking": true,
        "configuration": {
            "PlayerLaunchType": "FRAMESET",
            "PlayerScoLaunchType": "FRAMESET",
            "PlayerApiLocation": "TOP",
            "PlayerWindowTarget": "_self"
        }
    })
}

/// Recursively merges `overlay` into `base`. Objects merge key by key,
/// anything else in `overlay` replaces the base value; nulls are skipped.
pub fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(b), Value::Object(o)) => {
            for (k, v) in o {
                if v.is_null() {
                    continue;
                }
                match b.get_mut(k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        b.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (b, o) => {
            if !o.is_null() {
                *b = o.clone();
            }
        }
    }
}

pub fn merged_settings(overrides: Option<&Value>) -> Value {
    let mut settings = default_settings();
    if let Some(o) = overrides {
        deep_merge(&mut settings, o);
    }
    settings
}

/// Splits merged settings into the `launchLink` body and the registration
/// configuration body (`{"settings": [{settingId, value}]}`), if any.
pub(crate) fn split_settings(mut settings: Value, redirect_url: &str) -> (Value, Option<Value>) {
    let configuration = settings
        .as_object_mut()
        .and_then(|m| m.remove("configuration"));
    if let Value::Object(m) = &mut settings {
        m.insert("redirectOnExitUrl".into(), Value::String(redirect_url.to_string()));
    }

    let config_body = match configuration {
        Some(Value::Object(entries)) if !entries.is_empty() => {
            let list: Vec<Value> = entries
                .into_iter()
                .map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s,
                        other => other.to_string(),
                    };
                    json!({"settingId": k, "value": value})
                })
                .collect();
            Some(json!({ "settings": list }))
        }
        _ => None,
    };
    (settings, config_body)
}

fn canonical_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", encode(k), encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn sign(secret: &str, payload: &str) -> Result<HmacSha256, CloudError> {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| CloudError::NotConfigured)?;
    mac.update(payload.as_bytes());
    Ok(mac)
}

/// Direct course preview URL, authenticated by an HMAC-SHA256 signature over
/// the sorted query and valid until `expires`.
pub fn signed_preview_url(
    base_url: &str,
    app_id: &str,
    secret: &str,
    course_id: &str,
    registration_id: &str,
    redirect_url: &str,
    expires: DateTime<Utc>,
) -> Result<String, CloudError> {
    let mut params = BTreeMap::new();
    params.insert("appId".to_string(), app_id.to_string());
    params.insert("courseId".to_string(), course_id.to_string());
    params.insert("registrationId".to_string(), registration_id.to_string());
    params.insert("redirectUrl".to_string(), redirect_url.to_string());
    params.insert("expires".to_string(), expires.timestamp().to_string());

    let query = canonical_query(&params);
    let signature = URL_SAFE_NO_PAD.encode(sign(secret, &query)?.finalize().into_bytes());
    Ok(format!(
        "{}/courses/{}/preview?{}&signature={}",
        base_url.trim_end_matches('/'),
        encode(course_id),
        query,
        signature
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::Map;

    // Checks a preview query the way the player side would.
    fn verify_preview(secret: &str, query: &Map<String, Value>, now: DateTime<Utc>) -> bool {
        let mut params = BTreeMap::new();
        let mut signature = None;
        for (k, v) in query {
            let Some(v) = v.as_str() else { return false };
            if k == "signature" {
                signature = Some(v.to_string());
            } else {
                params.insert(k.clone(), v.to_string());
            }
        }
        let Some(signature) = signature else { return false };
        let Ok(expected) = URL_SAFE_NO_PAD.decode(signature) else { return false };

        let fresh = params
            .get("expires")
            .and_then(|e| e.parse::<i64>().ok())
            .is_some_and(|e| e > now.timestamp());
        if !fresh {
            return false;
        }

        match sign(secret, &canonical_query(&params)) {
            Ok(mac) => mac.verify_slice(&expected).is_ok(),
            Err(_) => false,
        }
    }

    fn query_of(url: &str) -> Map<String, Value> {
        let q = url.split_once('?').map(|(_, q)| q).unwrap_or_default();
        q.split('&')
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| {
                let v = percent_encoding::percent_decode_str(v).decode_utf8_lossy().to_string();
                (k.to_string(), Value::String(v))
            })
            .collect()
    }

    #[test]
    fn caller_settings_win_over_defaults() {
        let merged = merged_settings(Some(&json!({
            "expiry": 60,
            "configuration": {"PlayerWindowTarget": "_blank"}
        })));
        assert_eq!(merged["expiry"], 60);
        assert_eq!(merged["tracking"], true);
        assert_eq!(merged["configuration"]["PlayerWindowTarget"], "_blank");
        assert_eq!(merged["configuration"]["PlayerLaunchType"], "FRAMESET");
    }

    #[test]
    fn null_overrides_keep_defaults() {
        let merged = merged_settings(Some(&json!({"tracking": null})));
        assert_eq!(merged["tracking"], true);
    }

    #[test]
    fn split_moves_configuration_into_settings_list() {
        let (body, config) = split_settings(merged_settings(None), "https://lms/back");
        assert_eq!(body["redirectOnExitUrl"], "https://lms/back");
        assert!(body.get("configuration").is_none());
        let list = config.unwrap()["settings"].as_array().unwrap().clone();
        assert!(list.contains(&json!({"settingId": "PlayerApiLocation", "value": "TOP"})));
    }

    #[test]
    fn preview_signature_verifies_and_detects_tampering() {
        let now = Utc::now();
        let url = signed_preview_url(
            "https://cloud.example/api/v2/",
            "app",
            "s3cret",
            "course 1",
            "reg-1",
            "https://lms/back?x=1",
            now + Duration::hours(1),
        )
        .unwrap();
        assert!(url.starts_with("https://cloud.example/api/v2/courses/course%201/preview?"));

        let mut q = query_of(&url);
        assert!(verify_preview("s3cret", &q, now));
        assert!(!verify_preview("other", &q, now));
        assert!(!verify_preview("s3cret", &q, now + Duration::hours(2)));

        q.insert("registrationId".into(), Value::String("reg-2".into()));
        assert!(!verify_preview("s3cret", &q, now));
    }
}
