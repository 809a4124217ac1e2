use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;

/// Jurisdiction-specific parsing rules: the document-number shape, the
/// top-to-bottom field layout on the physical card, and the number template
/// that drives character-level error correction.
///
/// The template uses `A` for an alphabetic position and `#` for a digit
/// position. Regions with free-form numbers carry no template and fall back
/// to the generic correction preferences.
pub struct RegionRule {
    pub code: &'static str,
    pub name: &'static str,
    pub document_number: Regex,
    pub number_template: Option<&'static str>,
    pub layout: &'static [&'static str],
}

impl RegionRule {
    pub fn number_matches(&self, candidate: &str) -> bool {
        self.document_number.is_match(candidate)
    }
}

/// Lookup table mapping a region key to its rules, with one explicit
/// default entry used when no key matches. Lookups never fail.
pub struct RegionRuleTable {
    rules: HashMap<&'static str, RegionRule>,
    default_rule: RegionRule,
}

const STANDARD_LAYOUT: &[&str] = &[
    "document_number",
    "last_name",
    "first_name",
    "street",
    "city",
    "date_of_birth",
    "expiry_date",
];

impl RegionRuleTable {
    fn new() -> Self {
        let mut rules = HashMap::new();

        rules.insert(
            "CA",
            RegionRule {
                code: "CA",
                name: "CALIFORNIA",
                document_number: Regex::new(r"^[A-Z]\d{7}$").unwrap(),
                number_template: Some("A#######"),
                layout: STANDARD_LAYOUT,
            },
        );
        rules.insert(
            "TX",
            RegionRule {
                code: "TX",
                name: "TEXAS",
                document_number: Regex::new(r"^\d{8}$").unwrap(),
                number_template: Some("########"),
                layout: STANDARD_LAYOUT,
            },
        );
        rules.insert(
            "NY",
            RegionRule {
                code: "NY",
                name: "NEW YORK",
                document_number: Regex::new(r"^\d{9}$").unwrap(),
                number_template: Some("#########"),
                layout: STANDARD_LAYOUT,
            },
        );
        rules.insert(
            "FL",
            RegionRule {
                code: "FL",
                name: "FLORIDA",
                document_number: Regex::new(r"^[A-Z]\d{12}$").unwrap(),
                number_template: Some("A############"),
                layout: STANDARD_LAYOUT,
            },
        );
        rules.insert(
            "WA",
            RegionRule {
                code: "WA",
                name: "WASHINGTON",
                document_number: Regex::new(r"^WDL[A-Z0-9]{9}$").unwrap(),
                number_template: None,
                layout: STANDARD_LAYOUT,
            },
        );
        rules.insert(
            "IL",
            RegionRule {
                code: "IL",
                name: "ILLINOIS",
                document_number: Regex::new(r"^[A-Z]\d{11}$").unwrap(),
                number_template: Some("A###########"),
                layout: STANDARD_LAYOUT,
            },
        );

        let default_rule = RegionRule {
            code: "GEN",
            name: "GENERIC",
            document_number: Regex::new(r"^[A-Z0-9]{4,15}$").unwrap(),
            number_template: None,
            layout: STANDARD_LAYOUT,
        };

        RegionRuleTable {
            rules,
            default_rule,
        }
    }

    /// Rules for a region key, falling back to the generic entry.
    pub fn rule_for(&self, code: &str) -> &RegionRule {
        let code = code.trim().to_uppercase();
        self.rules
            .get(code.as_str())
            .unwrap_or(&self.default_rule)
    }

    /// Whether the key names a region this table knows specifically.
    pub fn is_known(&self, code: &str) -> bool {
        self.rules.contains_key(code.trim().to_uppercase().as_str())
    }

    pub fn default_rule(&self) -> &RegionRule {
        &self.default_rule
    }

    /// Detect a region from explicit jurisdiction text, e.g. a state name
    /// spelled out on the card or a two-letter code adjacent to a postal
    /// code ("SACRAMENTO CA 95814").
    pub fn detect_in_text(&self, text: &str) -> Option<&RegionRule> {
        let upper = text.to_uppercase();
        for rule in self.rules.values() {
            if NAME_BOUNDARY_PATTERNS
                .get(rule.code)
                .map(|p| p.is_match(&upper))
                .unwrap_or(false)
            {
                return Some(self.rule_for(rule.code));
            }
        }
        if let Some(caps) = CODE_NEAR_POSTAL.captures(&upper) {
            let code = caps.get(1).map(|m| m.as_str())?;
            if self.is_known(code) {
                return Some(self.rule_for(code));
            }
        }
        None
    }

    /// Detect a region from the shape of a document-number candidate.
    /// Ambiguous shapes (matching several regions) yield nothing rather
    /// than a guess.
    pub fn detect_by_number_shape(&self, candidate: &str) -> Option<&RegionRule> {
        let mut matched = None;
        for rule in self.rules.values() {
            if rule.number_matches(candidate) {
                if matched.is_some() {
                    return None;
                }
                matched = Some(rule.code);
            }
        }
        matched.map(|code| self.rule_for(code))
    }

    /// Region codes with specific rules, for diagnostics and demos.
    pub fn known_codes(&self) -> Vec<&'static str> {
        let mut codes: Vec<_> = self.rules.keys().copied().collect();
        codes.sort_unstable();
        codes
    }
}

lazy_static! {
    pub static ref REGION_RULES: RegionRuleTable = RegionRuleTable::new();

    // Full jurisdiction names as standalone words.
    static ref NAME_BOUNDARY_PATTERNS: HashMap<&'static str, Regex> = {
        let mut m = HashMap::new();
        m.insert("CA", Regex::new(r"\bCALIFORNIA\b").unwrap());
        m.insert("TX", Regex::new(r"\bTEXAS\b").unwrap());
        m.insert("NY", Regex::new(r"\bNEW YORK\b").unwrap());
        m.insert("FL", Regex::new(r"\bFLORIDA\b").unwrap());
        m.insert("WA", Regex::new(r"\bWASHINGTON\b").unwrap());
        m.insert("IL", Regex::new(r"\bILLINOIS\b").unwrap());
        m
    };

    // Two-letter code immediately preceding a ZIP, the usual address line.
    static ref CODE_NEAR_POSTAL: Regex =
        Regex::new(r"\b([A-Z]{2})\s+\d{5}(?:-\d{4})?\b").unwrap();
}
