//! Normalization of raw driver dumps into the canonical element tree.
//!
//! Three dialects are accepted:
//! - Android `uiautomator dump` XML,
//! - iOS accessibility JSON (flat `describe-all` arrays),
//! - canonical JSON that already matches [`UiElement`].
//!
//! Normalization is pure: the same payload always yields the same elements and
//! the same digest, which keeps rule-based verification replayable.

use std::collections::HashMap;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::core::types::{Bounds, ElementKind, Platform, ScreenSize, UiElement};

static NODE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(/?)node\b([^>]*?)(/?)>").unwrap());
static ATTR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"([\w:-]+)="([^"]*)""#).unwrap());
static BOUNDS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(-?\d+),(-?\d+)\]\[(-?\d+),(-?\d+)\]").unwrap());
static ENTITY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&(#x[0-9a-fA-F]+|#[0-9]+|amp|lt|gt|quot|apos);").unwrap());

/// Raw payload format produced by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    UiautomatorXml,
    IosJson,
    Canonical,
}

impl Dialect {
    pub fn platform(self) -> Platform {
        match self {
            Dialect::UiautomatorXml => Platform::Android,
            Dialect::IosJson => Platform::Ios,
            Dialect::Canonical => Platform::Unknown,
        }
    }
}

/// Element tree extracted from a raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedTree {
    pub platform: Platform,
    pub elements: Vec<UiElement>,
    pub focused_app: Option<String>,
    pub screen: Option<ScreenSize>,
    /// Reasons the tree is incomplete, joined when several apply.
    pub partial: Option<String>,
}

/// Parse `payload` in the given dialect, keeping at most `max_elements` elements.
pub fn normalize(dialect: Dialect, payload: &str, max_elements: usize) -> Result<NormalizedTree> {
    let mut tree = match dialect {
        Dialect::UiautomatorXml => parse_uiautomator(payload)?,
        Dialect::IosJson => parse_ios(payload)?,
        Dialect::Canonical => parse_canonical(payload)?,
    };
    if tree.elements.len() > max_elements {
        let dropped = tree.elements.len() - max_elements;
        tree.elements.truncate(max_elements);
        for el in &mut tree.elements {
            if el.parent.is_some_and(|p| p >= max_elements) {
                el.parent = None;
            }
        }
        add_partial(
            &mut tree.partial,
            format!("element cap {max_elements} reached, {dropped} elements omitted"),
        );
    }
    Ok(tree)
}

/// Stable content digest over the focused app and element tree.
///
/// Capture time and sequence numbers are excluded so identical screens share a digest.
pub fn digest(focused_app: Option<&str>, elements: &[UiElement]) -> String {
    #[derive(Serialize)]
    struct DigestInput<'a> {
        focused_app: Option<&'a str>,
        elements: &'a [UiElement],
    }
    let bytes = serde_json::to_vec(&DigestInput {
        focused_app,
        elements,
    })
    .unwrap_or_default();
    let hash = Sha256::digest(&bytes);
    hex::encode(&hash[..8])
}

fn add_partial(partial: &mut Option<String>, note: String) {
    match partial {
        Some(existing) => {
            existing.push_str("; ");
            existing.push_str(&note);
        }
        None => *partial = Some(note),
    }
}

#[derive(Debug)]
struct RawNode {
    attrs: HashMap<String, String>,
    raw_parent: Option<usize>,
}

fn parse_uiautomator(payload: &str) -> Result<NormalizedTree> {
    let mut raw: Vec<RawNode> = Vec::new();
    let mut stack: Vec<usize> = Vec::new();
    let mut partial = None;

    for caps in NODE_RE.captures_iter(payload) {
        let closing = !caps[1].is_empty();
        if closing {
            if stack.pop().is_none() {
                add_partial(&mut partial, "unbalanced closing node".to_string());
            }
            continue;
        }
        let attrs = ATTR_RE
            .captures_iter(&caps[2])
            .map(|a| (a[1].to_string(), unescape(&a[2])))
            .collect();
        let id = raw.len();
        raw.push(RawNode {
            attrs,
            raw_parent: stack.last().copied(),
        });
        let self_closing = !caps[3].is_empty();
        if !self_closing {
            stack.push(id);
        }
    }

    if raw.is_empty() {
        if payload.contains("<hierarchy") {
            return Ok(NormalizedTree {
                platform: Platform::Android,
                elements: Vec::new(),
                focused_app: None,
                screen: None,
                partial: Some("hierarchy contains no nodes".to_string()),
            });
        }
        return Err(anyhow!("uiautomator dump contains no hierarchy"));
    }
    if !stack.is_empty() {
        add_partial(&mut partial, "hierarchy truncated before closing".to_string());
    }
    if payload.contains("ERROR:") {
        add_partial(&mut partial, "uiautomator reported an error".to_string());
    }

    let focused_app = raw
        .iter()
        .filter_map(|n| n.attrs.get("package"))
        .find(|p| !p.is_empty())
        .cloned();
    let screen = raw.first().and_then(|root| {
        let b = parse_bounds(root.attrs.get("bounds")?)?;
        (!b.is_empty()).then(|| ScreenSize {
            width: b.right,
            height: b.bottom,
        })
    });

    // Map raw ids to kept indices; pruned nodes hand their children to the nearest kept ancestor.
    let mut kept_index: Vec<Option<usize>> = vec![None; raw.len()];
    let mut kept_depth: Vec<u32> = vec![0; raw.len()];
    let mut elements = Vec::new();
    for (id, node) in raw.iter().enumerate() {
        let ancestor = nearest_kept(&raw, &kept_index, node.raw_parent);
        if !is_informative(&node.attrs) {
            continue;
        }
        let index = elements.len();
        kept_index[id] = Some(index);
        let depth = ancestor.map_or(0, |(raw_id, _)| kept_depth[raw_id] + 1);
        kept_depth[id] = depth;
        elements.push(android_element(
            index,
            &node.attrs,
            depth,
            ancestor.map(|(_, kept)| kept),
        ));
    }

    Ok(NormalizedTree {
        platform: Platform::Android,
        elements,
        focused_app,
        screen,
        partial,
    })
}

fn nearest_kept(
    raw: &[RawNode],
    kept_index: &[Option<usize>],
    mut cursor: Option<usize>,
) -> Option<(usize, usize)> {
    while let Some(id) = cursor {
        if let Some(index) = kept_index[id] {
            return Some((id, index));
        }
        cursor = raw[id].raw_parent;
    }
    None
}

fn attr_flag(attrs: &HashMap<String, String>, key: &str, default: bool) -> bool {
    attrs.get(key).map_or(default, |v| v == "true")
}

fn attr_text(attrs: &HashMap<String, String>, key: &str) -> Option<String> {
    attrs
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn is_informative(attrs: &HashMap<String, String>) -> bool {
    attr_text(attrs, "text").is_some()
        || attr_text(attrs, "content-desc").is_some()
        || attr_flag(attrs, "clickable", false)
        || attr_flag(attrs, "long-clickable", false)
        || attr_flag(attrs, "checkable", false)
        || attr_flag(attrs, "scrollable", false)
        || attrs
            .get("class")
            .is_some_and(|c| android_kind(c, false) == ElementKind::TextField)
}

fn android_element(
    index: usize,
    attrs: &HashMap<String, String>,
    depth: u32,
    parent: Option<usize>,
) -> UiElement {
    let clickable = attr_flag(attrs, "clickable", false);
    let bounds = attrs
        .get("bounds")
        .and_then(|b| parse_bounds(b))
        .unwrap_or_default();
    let kind = attrs
        .get("class")
        .map_or(ElementKind::Other, |c| android_kind(c, clickable));
    let checkable = attr_flag(attrs, "checkable", false);
    UiElement {
        index,
        kind,
        text: attr_text(attrs, "text"),
        description: attr_text(attrs, "content-desc"),
        resource_id: attr_text(attrs, "resource-id"),
        bounds,
        enabled: attr_flag(attrs, "enabled", true),
        visible: attr_flag(attrs, "visible-to-user", true) && !bounds.is_empty(),
        focused: attr_flag(attrs, "focused", false),
        clickable,
        scrollable: attr_flag(attrs, "scrollable", false),
        checked: checkable.then(|| attr_flag(attrs, "checked", false)),
        depth,
        parent,
    }
}

fn android_kind(class: &str, clickable: bool) -> ElementKind {
    let simple = class.rsplit('.').next().unwrap_or(class);
    match simple {
        "EditText" | "AutoCompleteTextView" | "MultiAutoCompleteTextView" => {
            ElementKind::TextField
        }
        "CheckBox" | "CheckedTextView" | "RadioButton" => ElementKind::Checkbox,
        "Switch" | "SwitchCompat" | "SwitchMaterial" | "ToggleButton" => ElementKind::Switch,
        "RecyclerView" | "ListView" | "GridView" | "ScrollView" | "HorizontalScrollView"
        | "NestedScrollView" | "ViewPager" => ElementKind::List,
        "TabWidget" | "TabLayout" | "TabView" => ElementKind::Tab,
        s if s.ends_with("Button") => ElementKind::Button,
        "TextView" => ElementKind::Text,
        "ImageView" if clickable => ElementKind::Button,
        "ImageView" => ElementKind::Image,
        "WebView" => ElementKind::Container,
        s if s.ends_with("Layout") || s == "ViewGroup" || s == "View" => {
            if clickable {
                ElementKind::Button
            } else {
                ElementKind::Container
            }
        }
        _ => ElementKind::Other,
    }
}

fn parse_bounds(raw: &str) -> Option<Bounds> {
    let caps = BOUNDS_RE.captures(raw)?;
    let n = |i: usize| caps[i].parse::<i32>().ok();
    Some(Bounds::new(n(1)?, n(2)?, n(3)?, n(4)?))
}

fn unescape(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    ENTITY_RE
        .replace_all(raw, |caps: &regex::Captures<'_>| {
            let entity = &caps[1];
            match entity {
                "amp" => "&".to_string(),
                "lt" => "<".to_string(),
                "gt" => ">".to_string(),
                "quot" => "\"".to_string(),
                "apos" => "'".to_string(),
                _ => {
                    let code = match entity.strip_prefix("#x") {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => entity[1..].parse::<u32>().ok(),
                    };
                    code.and_then(char::from_u32)
                        .map_or_else(|| caps[0].to_string(), |c| c.to_string())
                }
            }
        })
        .into_owned()
}

#[derive(Debug, Deserialize)]
struct IosFrame {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

#[derive(Debug, Deserialize)]
struct IosNode {
    #[serde(rename = "AXLabel")]
    label: Option<String>,
    #[serde(rename = "AXValue")]
    value: Option<String>,
    #[serde(rename = "AXUniqueId")]
    unique_id: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    frame: Option<IosFrame>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    focused: bool,
}

fn default_true() -> bool {
    true
}

fn parse_ios(payload: &str) -> Result<NormalizedTree> {
    let nodes: Vec<IosNode> =
        serde_json::from_str(payload).context("parse iOS accessibility json")?;
    let mut elements = Vec::new();
    let mut screen = None;
    for node in nodes {
        let bounds = node.frame.as_ref().map_or_else(Bounds::default, |f| {
            Bounds::new(
                f.x.round() as i32,
                f.y.round() as i32,
                (f.x + f.width).round() as i32,
                (f.y + f.height).round() as i32,
            )
        });
        let type_name = node.kind.as_deref().unwrap_or("Other");
        if type_name == "Application" {
            screen.get_or_insert(ScreenSize {
                width: bounds.right,
                height: bounds.bottom,
            });
            continue;
        }
        let kind = ios_kind(type_name);
        let label = node.label.filter(|s| !s.trim().is_empty());
        let value = node.value.filter(|s| !s.trim().is_empty());
        let interactive = !matches!(kind, ElementKind::Container | ElementKind::Other);
        if label.is_none() && value.is_none() && !interactive {
            continue;
        }
        let checked = match kind {
            ElementKind::Switch | ElementKind::Checkbox => value.as_deref().map(|v| v == "1"),
            _ => None,
        };
        let (text, description) = match kind {
            ElementKind::TextField => (value, label),
            _ => (label, value.filter(|_| checked.is_none())),
        };
        elements.push(UiElement {
            index: elements.len(),
            kind,
            text,
            description,
            resource_id: node.unique_id.filter(|s| !s.is_empty()),
            bounds,
            enabled: node.enabled,
            visible: !bounds.is_empty(),
            focused: node.focused,
            clickable: matches!(
                kind,
                ElementKind::Button
                    | ElementKind::Link
                    | ElementKind::Tab
                    | ElementKind::Switch
                    | ElementKind::Checkbox
                    | ElementKind::TextField
            ),
            scrollable: kind == ElementKind::List,
            checked,
            depth: 0,
            parent: None,
        });
    }
    Ok(NormalizedTree {
        platform: Platform::Ios,
        elements,
        focused_app: None,
        screen,
        partial: None,
    })
}

fn ios_kind(type_name: &str) -> ElementKind {
    match type_name {
        "Button" => ElementKind::Button,
        "StaticText" => ElementKind::Text,
        "TextField" | "SecureTextField" | "SearchField" | "TextView" => ElementKind::TextField,
        "Image" | "Icon" => ElementKind::Image,
        "Switch" | "Toggle" => ElementKind::Switch,
        "CheckBox" => ElementKind::Checkbox,
        "Table" | "CollectionView" | "ScrollView" | "Cell" => ElementKind::List,
        "Tab" | "TabBar" => ElementKind::Tab,
        "Link" => ElementKind::Link,
        "Group" | "Window" | "Other" => ElementKind::Container,
        _ => ElementKind::Other,
    }
}

#[derive(Debug, Deserialize)]
struct CanonicalPayload {
    #[serde(default)]
    platform: Option<Platform>,
    #[serde(default)]
    focused_app: Option<String>,
    #[serde(default)]
    screen: Option<ScreenSize>,
    elements: Vec<UiElement>,
}

fn parse_canonical(payload: &str) -> Result<NormalizedTree> {
    let parsed: CanonicalPayload =
        serde_json::from_str(payload).context("parse canonical element json")?;
    let remap: HashMap<usize, usize> = parsed
        .elements
        .iter()
        .enumerate()
        .map(|(pos, el)| (el.index, pos))
        .collect();
    let mut partial = None;
    if remap.len() != parsed.elements.len() {
        add_partial(&mut partial, "duplicate element indices".to_string());
    }
    let elements = parsed
        .elements
        .into_iter()
        .enumerate()
        .map(|(pos, mut el)| {
            el.index = pos;
            el.parent = el
                .parent
                .and_then(|p| remap.get(&p).copied())
                .filter(|p| *p < pos);
            el
        })
        .collect();
    Ok(NormalizedTree {
        platform: parsed.platform.unwrap_or(Platform::Unknown),
        elements,
        focused_app: parsed.focused_app,
        screen: parsed.screen,
        partial,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS_DUMP: &str = r#"<?xml version='1.0' encoding='UTF-8' standalone='yes' ?>
<hierarchy rotation="0">
  <node index="0" text="" resource-id="" class="android.widget.FrameLayout" package="com.android.settings" content-desc="" checkable="false" checked="false" clickable="false" enabled="true" focusable="false" focused="false" scrollable="false" long-clickable="false" password="false" selected="false" bounds="[0,0][1080,2400]">
    <node index="0" text="" resource-id="" class="android.widget.LinearLayout" package="com.android.settings" content-desc="" checkable="false" checked="false" clickable="false" enabled="true" focusable="false" focused="false" scrollable="false" long-clickable="false" password="false" selected="false" bounds="[0,0][1080,2400]">
      <node index="0" text="Battery" resource-id="android:id/title" class="android.widget.TextView" package="com.android.settings" content-desc="" checkable="false" checked="false" clickable="false" enabled="true" focusable="false" focused="false" scrollable="false" long-clickable="false" password="false" selected="false" bounds="[42,600][400,660]" />
      <node index="1" text="" resource-id="com.android.settings:id/switch" class="android.widget.Switch" package="com.android.settings" content-desc="Battery saver" checkable="true" checked="true" clickable="true" enabled="true" focusable="true" focused="false" scrollable="false" long-clickable="false" password="false" selected="false" bounds="[900,600][1040,660]" />
      <node index="2" text="84% &amp; charging" resource-id="" class="android.widget.TextView" package="com.android.settings" content-desc="" checkable="false" checked="false" clickable="false" enabled="true" focusable="false" focused="false" scrollable="false" long-clickable="false" password="false" selected="false" bounds="[42,680][600,720]" />
    </node>
  </node>
</hierarchy>"#;

    #[test]
    fn uiautomator_prunes_layout_containers() {
        let tree = normalize(Dialect::UiautomatorXml, SETTINGS_DUMP, 100).expect("normalize");
        assert_eq!(tree.platform, Platform::Android);
        assert_eq!(tree.focused_app.as_deref(), Some("com.android.settings"));
        assert_eq!(
            tree.screen,
            Some(ScreenSize {
                width: 1080,
                height: 2400
            })
        );
        assert_eq!(tree.elements.len(), 3);
        assert!(tree.partial.is_none());

        let battery = &tree.elements[0];
        assert_eq!(battery.kind, ElementKind::Text);
        assert_eq!(battery.text.as_deref(), Some("Battery"));
        assert_eq!(battery.parent, None);
        assert_eq!(battery.depth, 0);

        let switch = &tree.elements[1];
        assert_eq!(switch.kind, ElementKind::Switch);
        assert_eq!(switch.checked, Some(true));
        assert_eq!(switch.description.as_deref(), Some("Battery saver"));
        assert!(switch.clickable);

        assert_eq!(tree.elements[2].text.as_deref(), Some("84% & charging"));
    }

    #[test]
    fn clickable_layout_keeps_children_nested() {
        let xml = r#"<hierarchy>
<node class="android.widget.LinearLayout" clickable="true" bounds="[0,0][100,100]" package="p">
  <node class="android.widget.TextView" text="Wi&#8209;Fi" bounds="[0,0][100,50]"/>
</node></hierarchy>"#;
        let tree = normalize(Dialect::UiautomatorXml, xml, 100).expect("normalize");
        assert_eq!(tree.elements.len(), 2);
        assert_eq!(tree.elements[0].kind, ElementKind::Button);
        assert_eq!(tree.elements[1].parent, Some(0));
        assert_eq!(tree.elements[1].depth, 1);
        assert_eq!(tree.elements[1].text.as_deref(), Some("Wi\u{2011}Fi"));
    }

    #[test]
    fn element_cap_marks_state_partial() {
        let tree = normalize(Dialect::UiautomatorXml, SETTINGS_DUMP, 2).expect("normalize");
        assert_eq!(tree.elements.len(), 2);
        let note = tree.partial.expect("partial");
        assert!(note.contains("1 elements omitted"));
    }

    #[test]
    fn truncated_dump_is_partial_not_fatal() {
        let cut = &SETTINGS_DUMP[..SETTINGS_DUMP.find("index=\"2\"").expect("marker")];
        let tree = normalize(Dialect::UiautomatorXml, cut, 100).expect("normalize");
        assert_eq!(tree.elements.len(), 2);
        assert!(tree.partial.is_some());
    }

    #[test]
    fn garbage_payload_is_an_error() {
        assert!(normalize(Dialect::UiautomatorXml, "error: device offline", 10).is_err());
        assert!(normalize(Dialect::IosJson, "{", 10).is_err());
    }

    #[test]
    fn ios_json_maps_types_and_frames() {
        let payload = r#"[
            {"type": "Application", "AXLabel": "Settings", "frame": {"x": 0, "y": 0, "width": 390, "height": 844}},
            {"type": "Button", "AXLabel": "General", "AXUniqueId": "general", "frame": {"x": 16, "y": 100, "width": 358, "height": 44}, "enabled": true},
            {"type": "Other", "frame": {"x": 0, "y": 0, "width": 10, "height": 10}},
            {"type": "Switch", "AXLabel": "Airplane Mode", "AXValue": "0", "frame": {"x": 300, "y": 160, "width": 51, "height": 31}}
        ]"#;
        let tree = normalize(Dialect::IosJson, payload, 100).expect("normalize");
        assert_eq!(tree.platform, Platform::Ios);
        assert_eq!(
            tree.screen,
            Some(ScreenSize {
                width: 390,
                height: 844
            })
        );
        assert_eq!(tree.elements.len(), 2);
        assert_eq!(tree.elements[0].resource_id.as_deref(), Some("general"));
        assert_eq!(tree.elements[0].bounds, Bounds::new(16, 100, 374, 144));
        assert_eq!(tree.elements[1].checked, Some(false));
    }

    #[test]
    fn canonical_payload_is_reindexed() {
        let payload = r#"{"focused_app": "demo", "elements": [
            {"index": 10, "kind": "container", "bounds": {"left":0,"top":0,"right":10,"bottom":10}, "enabled": true, "visible": true},
            {"index": 11, "kind": "button", "text": "OK", "bounds": {"left":0,"top":0,"right":5,"bottom":5}, "enabled": true, "visible": true, "parent": 10, "depth": 1}
        ]}"#;
        let tree = normalize(Dialect::Canonical, payload, 100).expect("normalize");
        assert_eq!(tree.elements[1].index, 1);
        assert_eq!(tree.elements[1].parent, Some(0));
        assert_eq!(tree.focused_app.as_deref(), Some("demo"));
    }

    #[test]
    fn digest_is_stable_and_content_sensitive() {
        let a = normalize(Dialect::UiautomatorXml, SETTINGS_DUMP, 100).expect("normalize");
        let b = normalize(Dialect::UiautomatorXml, SETTINGS_DUMP, 100).expect("normalize");
        let da = digest(a.focused_app.as_deref(), &a.elements);
        assert_eq!(da, digest(b.focused_app.as_deref(), &b.elements));
        assert_eq!(da.len(), 16);
        assert_ne!(da, digest(Some("other.app"), &a.elements));
    }
}
