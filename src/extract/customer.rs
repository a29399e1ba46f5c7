use std::collections::BTreeSet;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::config::CustomerSources;
use crate::model::work_item::WorkItem;

static CUSTOMER_BRACKET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([^{}]+)\}").expect("static regex"));

static REGRESSION_MARKER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(regression_([A-Za-z0-9_]+))\b").expect("static regex"));

/// Alternate spelling → canonical customer key. Applied only when the key is known.
const CUSTOMER_ALIASES: &[(&str, &str)] = &[("fifaplus", "fifa")];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerSource {
    /// `{CUSTOMER}` in the title, known through a declared regression marker.
    PytestMarkers,
    /// `{CUSTOMER}` in the title, known through a per-customer config file.
    CustomerConfig,
    TagKeyword,
    TitleKeyword,
    /// `{CUSTOMER}` in the title that matches nothing known.
    Unsupported,
    NoneDetected,
}

impl CustomerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CustomerSource::PytestMarkers => "pytest_markers",
            CustomerSource::CustomerConfig => "customer_config",
            CustomerSource::TagKeyword => "tag_keyword",
            CustomerSource::TitleKeyword => "title_keyword",
            CustomerSource::Unsupported => "unsupported",
            CustomerSource::NoneDetected => "none_detected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomerResolution {
    pub customer: Option<String>,
    pub needs_manual_credentials: bool,
    pub source: CustomerSource,
    pub reason: String,
}

/// Customers the test suite knows how to run against.
#[derive(Debug, Clone, Default)]
pub struct CustomerCatalog {
    /// Declared markers with their original spelling.
    markers: BTreeSet<String>,
    marker_customers: BTreeSet<String>,
    config_customers: BTreeSet<String>,
    keywords: Vec<(String, Regex)>,
}

impl CustomerCatalog {
    pub fn new(
        markers: impl IntoIterator<Item = String>,
        config_customers: impl IntoIterator<Item = String>,
    ) -> Self {
        let markers: BTreeSet<String> = markers.into_iter().collect();
        let marker_customers = markers
            .iter()
            .filter_map(|m| {
                REGRESSION_MARKER
                    .captures(m)
                    .map(|c| c[2].to_lowercase())
            })
            .collect();
        let config_customers = config_customers
            .into_iter()
            .map(|c| c.to_lowercase())
            .collect();

        let mut catalog = Self {
            markers,
            marker_customers,
            config_customers,
            keywords: Vec::new(),
        };
        catalog.keywords = catalog
            .customers()
            .filter_map(|c| {
                let pattern = format!(r"(?i)\b{}\b", regex::escape(c));
                Regex::new(&pattern).ok().map(|re| (c.to_string(), re))
            })
            .collect();
        catalog
    }

    /// Scan the marker manifest and the per-customer config directory.
    ///
    /// Either source may be missing; that only shrinks the catalog.
    pub fn discover(sources: &CustomerSources) -> Self {
        let markers = match std::fs::read_to_string(&sources.markers_manifest) {
            Ok(contents) => parse_markers(&contents),
            Err(e) => {
                tracing::warn!(
                    path = %sources.markers_manifest.display(),
                    error = %e,
                    "could not read marker manifest"
                );
                Vec::new()
            }
        };
        let configs = customer_config_names(&sources.config_dir);
        let catalog = Self::new(markers, configs);
        tracing::info!(
            customers = ?catalog.customers().collect::<Vec<_>>(),
            markers = catalog.markers.len(),
            "discovered customers"
        );
        catalog
    }

    pub fn customers(&self) -> impl Iterator<Item = &str> {
        self.marker_customers
            .union(&self.config_customers)
            .map(String::as_str)
    }

    pub fn is_known(&self, customer: &str) -> bool {
        let c = customer.to_lowercase();
        self.marker_customers.contains(&c) || self.config_customers.contains(&c)
    }

    /// The declared marker for `customer`, matched case-insensitively.
    pub fn marker_for(&self, customer: &str) -> Option<&str> {
        let wanted = format!("regression_{customer}");
        self.markers
            .iter()
            .find(|m| m.eq_ignore_ascii_case(&wanted))
            .map(String::as_str)
    }

    fn canonical(&self, name: &str) -> String {
        CUSTOMER_ALIASES
            .iter()
            .find(|(alias, target)| *alias == name && self.is_known(target))
            .map(|(_, target)| target.to_string())
            .unwrap_or_else(|| name.to_string())
    }

    fn keyword_in(&self, text: &str) -> Option<&str> {
        self.keywords
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(c, _)| c.as_str())
    }
}

/// Every `regression_<CUSTOMER>` token in a test-configuration manifest.
pub fn parse_markers(manifest: &str) -> Vec<String> {
    REGRESSION_MARKER
        .captures_iter(manifest)
        .map(|c| c[1].to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn customer_config_names(dir: &Path) -> Vec<String> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(path = %dir.display(), error = %e, "no customer config directory");
            return Vec::new();
        }
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter_map(|path| {
            path.file_stem()
                .map(|stem| stem.to_string_lossy().to_lowercase())
        })
        .filter(|stem| !stem.is_empty() && !stem.starts_with('.'))
        .collect()
}

pub fn resolve_customer(item: &WorkItem, catalog: &CustomerCatalog) -> CustomerResolution {
    if let Some(raw) = CUSTOMER_BRACKET
        .captures(&item.title)
        .map(|c| c[1].trim().to_string())
        .filter(|raw| !raw.is_empty())
    {
        let customer = catalog.canonical(&raw.to_lowercase());
        if catalog.marker_customers.contains(&customer) {
            return CustomerResolution {
                reason: format!("{{{raw}}} in title matches declared marker"),
                customer: Some(customer),
                needs_manual_credentials: false,
                source: CustomerSource::PytestMarkers,
            };
        }
        if catalog.config_customers.contains(&customer) {
            return CustomerResolution {
                reason: format!("{{{raw}}} in title matches customer config"),
                customer: Some(customer),
                needs_manual_credentials: false,
                source: CustomerSource::CustomerConfig,
            };
        }
        return CustomerResolution {
            reason: format!("{{{raw}}} in title is not a supported customer"),
            customer: Some(customer),
            needs_manual_credentials: true,
            source: CustomerSource::Unsupported,
        };
    }

    for tag in &item.tags {
        if let Some(customer) = catalog.keyword_in(tag) {
            return CustomerResolution {
                reason: format!("tag {tag:?} names {customer}"),
                customer: Some(customer.to_string()),
                needs_manual_credentials: false,
                source: CustomerSource::TagKeyword,
            };
        }
    }

    if let Some(customer) = catalog.keyword_in(&item.title) {
        return CustomerResolution {
            reason: format!("title names {customer}"),
            customer: Some(customer.to_string()),
            needs_manual_credentials: false,
            source: CustomerSource::TitleKeyword,
        };
    }

    CustomerResolution {
        customer: None,
        needs_manual_credentials: true,
        source: CustomerSource::NoneDetected,
        reason: "no customer bracket or keyword found".into(),
    }
}
