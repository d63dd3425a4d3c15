//! Upstream credential selection. Pure functions, no I/O.

use rand::Rng;

use crate::config::Provider;

/// Parse a provider's key material: `api_keys` split on ';', trimmed,
/// empties dropped; falls back to the single `api_key`. Order-preserving.
pub fn extract_keys(provider: &Provider) -> Vec<String> {
    if let Some(keys) = &provider.api_keys {
        let keys: Vec<String> = keys
            .split(';')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string)
            .collect();
        if !keys.is_empty() {
            return keys;
        }
    }
    provider
        .api_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(|k| vec![k.to_string()])
        .unwrap_or_default()
}

/// Pick one key at random: uniform, or weight-proportional when
/// `key_weights` matches the key list in length with a positive total.
pub fn select_key(provider: &Provider) -> Option<String> {
    let keys = extract_keys(provider);
    if keys.is_empty() {
        return None;
    }
    if keys.len() == 1 {
        return keys.into_iter().next();
    }

    let mut rng = rand::rng();

    if let Some(weights) = &provider.key_weights
        && weights.len() == keys.len()
    {
        let total: f64 = weights.iter().filter(|w| w.is_finite() && **w > 0.0).sum();
        if total > 0.0 {
            let mut roll = rng.random_range(0.0..total);
            for (key, weight) in keys.iter().zip(weights) {
                if !(weight.is_finite() && *weight > 0.0) {
                    continue;
                }
                if roll < *weight {
                    return Some(key.clone());
                }
                roll -= weight;
            }
            // Float edge: fall through to the last weighted key
            return keys
                .iter()
                .zip(weights)
                .filter(|(_, w)| w.is_finite() && **w > 0.0)
                .map(|(k, _)| k.clone())
                .next_back();
        }
    }

    let index = rng.random_range(0..keys.len());
    Some(keys[index].clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn provider(api_key: Option<&str>, api_keys: Option<&str>) -> Provider {
        Provider {
            name: "test".to_string(),
            api_key: api_key.map(str::to_string),
            api_keys: api_keys.map(str::to_string),
            base_url: "https://example.com/v1/messages".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_extract_keys_order_preserving() {
        let p = provider(None, Some("k1;k2;k3"));
        assert_eq!(extract_keys(&p), vec!["k1", "k2", "k3"]);
    }

    #[test]
    fn test_extract_keys_trims_and_drops_empties() {
        let p = provider(None, Some(" k1 ;; k2 ;"));
        assert_eq!(extract_keys(&p), vec!["k1", "k2"]);
    }

    #[test]
    fn test_extract_keys_falls_back_to_single() {
        let p = provider(Some("solo"), None);
        assert_eq!(extract_keys(&p), vec!["solo"]);
        let p = provider(Some("solo"), Some(" ; "));
        assert_eq!(extract_keys(&p), vec!["solo"]);
    }

    #[test]
    fn test_select_key_none_when_empty() {
        let p = provider(None, None);
        assert!(select_key(&p).is_none());
    }

    #[test]
    fn test_select_key_covers_all_keys() {
        let p = provider(None, Some("k1;k2;k3"));
        let seen: HashSet<String> = (0..100).filter_map(|_| select_key(&p)).collect();
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_select_key_skips_zero_weight() {
        let mut p = provider(None, Some("k1;k2"));
        p.key_weights = Some(vec![0.0, 1.0]);
        for _ in 0..50 {
            assert_eq!(select_key(&p).as_deref(), Some("k2"));
        }
    }

    #[test]
    fn test_select_key_ignores_mismatched_weights() {
        let mut p = provider(None, Some("k1;k2;k3"));
        p.key_weights = Some(vec![1.0]);
        let seen: HashSet<String> = (0..100).filter_map(|_| select_key(&p)).collect();
        assert_eq!(seen.len(), 3);
    }
}
