//! Country code to English name lookup for secure internet locations.

use std::collections::HashMap;
use std::sync::OnceLock;

static COUNTRY_NAMES: OnceLock<CountryNames> = OnceLock::new();

const TABLE: &[(&str, &str)] = &[
    ("AE", "United Arab Emirates"),
    ("AM", "Armenia"),
    ("AR", "Argentina"),
    ("AT", "Austria"),
    ("AU", "Australia"),
    ("AZ", "Azerbaijan"),
    ("BE", "Belgium"),
    ("BG", "Bulgaria"),
    ("BR", "Brazil"),
    ("CA", "Canada"),
    ("CH", "Switzerland"),
    ("CL", "Chile"),
    ("CO", "Colombia"),
    ("CR", "Costa Rica"),
    ("CY", "Cyprus"),
    ("CZ", "Czechia"),
    ("DE", "Germany"),
    ("DK", "Denmark"),
    ("EE", "Estonia"),
    ("ES", "Spain"),
    ("FI", "Finland"),
    ("FR", "France"),
    ("GB", "United Kingdom"),
    ("GE", "Georgia"),
    ("GR", "Greece"),
    ("HR", "Croatia"),
    ("HU", "Hungary"),
    ("IE", "Ireland"),
    ("IL", "Israel"),
    ("IN", "India"),
    ("IS", "Iceland"),
    ("IT", "Italy"),
    ("JP", "Japan"),
    ("KE", "Kenya"),
    ("KR", "South Korea"),
    ("LT", "Lithuania"),
    ("LU", "Luxembourg"),
    ("LV", "Latvia"),
    ("MA", "Morocco"),
    ("MK", "North Macedonia"),
    ("MT", "Malta"),
    ("MX", "Mexico"),
    ("MY", "Malaysia"),
    ("NG", "Nigeria"),
    ("NL", "The Netherlands"),
    ("NO", "Norway"),
    ("NZ", "New Zealand"),
    ("PL", "Poland"),
    ("PT", "Portugal"),
    ("RO", "Romania"),
    ("RS", "Serbia"),
    ("SE", "Sweden"),
    ("SG", "Singapore"),
    ("SI", "Slovenia"),
    ("SK", "Slovakia"),
    ("TH", "Thailand"),
    ("TR", "Türkiye"),
    ("UA", "Ukraine"),
    ("UG", "Uganda"),
    ("US", "United States"),
    ("UY", "Uruguay"),
    ("ZA", "South Africa"),
];

/// Read-only table of country names, built once per process.
#[derive(Debug)]
pub struct CountryNames {
    names: HashMap<&'static str, &'static str>,
}

impl CountryNames {
    /// The process-wide table, initialized on first use.
    pub fn global() -> &'static CountryNames {
        COUNTRY_NAMES.get_or_init(|| CountryNames {
            names: TABLE.iter().copied().collect(),
        })
    }

    /// English name for an ISO 3166-1 alpha-2 code (case-insensitive).
    pub fn name(&self, code: &str) -> Option<&'static str> {
        self.names.get(code.to_ascii_uppercase().as_str()).copied()
    }

    /// English name, or the code itself when unknown.
    pub fn name_or_code<'a>(&self, code: &'a str) -> &'a str {
        self.name(code).unwrap_or(code)
    }
}
