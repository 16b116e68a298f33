use crate::{domain::money, models::TaxRateEntity};

#[derive(Debug, Clone)]
pub struct TaxRule {
    pub country: String,
    pub region: Option<String>,
    pub rate_bps: i32,
    pub is_active: bool,
}

impl From<&TaxRateEntity> for TaxRule {
    fn from(rate: &TaxRateEntity) -> Self {
        Self {
            country: rate.country.clone(),
            region: rate.region.clone(),
            rate_bps: rate.rate_bps,
            is_active: rate.is_active,
        }
    }
}

/// Resolves the rate for a destination. A region-specific rate beats a
/// country-wide one; no match is zero.
pub fn resolve_rate_bps(rules: &[TaxRule], country: &str, region: Option<&str>) -> i32 {
    let active_in_country = rules
        .iter()
        .filter(|rule| rule.is_active && rule.country.eq_ignore_ascii_case(country));

    let mut country_wide = None;
    for rule in active_in_country {
        match (&rule.region, region) {
            (Some(rule_region), Some(region)) if rule_region.eq_ignore_ascii_case(region) => {
                return rule.rate_bps;
            }
            (None, _) => country_wide = Some(rule.rate_bps),
            _ => {}
        }
    }
    country_wide.unwrap_or(0)
}

pub fn tax_for(taxable_cents: i64, rate_bps: i32) -> i64 {
    money::apply_bps(taxable_cents, rate_bps)
}

pub fn validate_country(country: &str) -> Option<String> {
    let country = country.trim();
    (country.len() == 2 && country.chars().all(|c| c.is_ascii_alphabetic()))
        .then(|| country.to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(country: &str, region: Option<&str>, rate_bps: i32) -> TaxRule {
        TaxRule {
            country: country.into(),
            region: region.map(str::to_string),
            rate_bps,
            is_active: true,
        }
    }

    #[test]
    fn region_beats_country() {
        let rules = vec![rule("US", None, 500), rule("US", Some("CA"), 725)];
        assert_eq!(resolve_rate_bps(&rules, "us", Some("ca")), 725);
        assert_eq!(resolve_rate_bps(&rules, "US", Some("OR")), 500);
        assert_eq!(resolve_rate_bps(&rules, "US", None), 500);
    }

    #[test]
    fn unknown_destination_is_untaxed() {
        let rules = vec![rule("US", Some("CA"), 725)];
        assert_eq!(resolve_rate_bps(&rules, "US", Some("NV")), 0);
        assert_eq!(resolve_rate_bps(&rules, "DE", None), 0);
    }

    #[test]
    fn inactive_rates_are_skipped() {
        let mut inactive = rule("GB", None, 2000);
        inactive.is_active = false;
        assert_eq!(resolve_rate_bps(&[inactive], "GB", None), 0);
    }

    #[test]
    fn countries_are_two_letters() {
        assert_eq!(validate_country(" de "), Some("DE".into()));
        assert_eq!(validate_country("DEU"), None);
        assert_eq!(validate_country("1A"), None);
    }
}
