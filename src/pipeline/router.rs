//! Request-to-`Location` matching (spec.md §6 `locations[].hosts/prefixs`).
//!
//! One `Router` is built per configured `Server`, over the subset of
//! `locations[]` that server lists by name. Grounded on the matching shape
//! of the teacher's `proxy/router.rs` `MatchEntry` (host filter, then
//! longest-prefix-wins), but rewired onto spec.md's flat
//! `hosts`/`prefixs`/`rewrites` location schema instead of the teacher's
//! APISIX route object — `matchit`'s trie matching doesn't fit a schema
//! with no wildcard/parametric segments, so this does a direct longest-
//! prefix scan instead (location counts per server are small).

use crate::config::Location;

pub struct Router {
    locations: Vec<Location>,
}

impl Router {
    /// Builds a router over exactly the locations named in `location_names`,
    /// in the order given by the full configuration's `locations[]` list.
    pub fn new(all_locations: &[Location], location_names: &[String]) -> Self {
        let locations = location_names
            .iter()
            .filter_map(|name| all_locations.iter().find(|l| &l.name == name).cloned())
            .collect();
        Self { locations }
    }

    /// Finds the best-matching location for `host`/`path`: among locations
    /// whose `hosts` list is empty (host-agnostic) or contains `host`,
    /// picks the one with the longest matching prefix.
    pub fn match_request(&self, host: &str, path: &str) -> Option<&Location> {
        let mut best: Option<(&Location, usize)> = None;

        for location in &self.locations {
            if !location.hosts.is_empty() && !location.hosts.iter().any(|h| h == host) {
                continue;
            }

            let prefix_len = location
                .prefixs
                .iter()
                .filter(|p| path.starts_with(p.as_str()))
                .map(|p| p.len())
                .max();

            // a location with no configured prefixes matches every path,
            // at the lowest precedence (weight 0).
            if prefix_len.is_none() && !location.prefixs.is_empty() {
                continue;
            }

            let candidate_len = prefix_len.unwrap_or(0);
            if best.map(|(_, best_len)| candidate_len > best_len).unwrap_or(true) {
                best = Some((location, candidate_len));
            }
        }

        best.map(|(location, _)| location)
    }

    /// Applies the location's `rewrites` map: if any configured source
    /// prefix matches `path`, replaces that prefix with its target.
    pub fn rewrite_path(location: &Location, path: &str) -> String {
        for (from, to) in &location.rewrites {
            if let Some(rest) = path.strip_prefix(from.as_str()) {
                return format!("{to}{rest}");
            }
        }
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn location(name: &str, hosts: Vec<&str>, prefixs: Vec<&str>) -> Location {
        Location {
            name: name.to_string(),
            upstream: "backend".to_string(),
            cache: None,
            compress: None,
            prefixs: prefixs.into_iter().map(String::from).collect(),
            rewrites: HashMap::new(),
            hosts: hosts.into_iter().map(String::from).collect(),
            request_header: HashMap::new(),
            response_header: HashMap::new(),
        }
    }

    #[test]
    fn test_longest_prefix_wins() {
        let locs = vec![
            location("root", vec![], vec!["/"]),
            location("api", vec![], vec!["/api"]),
        ];
        let names: Vec<String> = locs.iter().map(|l| l.name.clone()).collect();
        let router = Router::new(&locs, &names);

        let matched = router.match_request("example.com", "/api/users").unwrap();
        assert_eq!("api", matched.name);
    }

    #[test]
    fn test_host_filter_excludes_non_matching_host() {
        let locs = vec![location("only-a", vec!["a.example.com"], vec!["/"])];
        let names: Vec<String> = locs.iter().map(|l| l.name.clone()).collect();
        let router = Router::new(&locs, &names);

        assert!(router.match_request("b.example.com", "/").is_none());
        assert!(router.match_request("a.example.com", "/").is_some());
    }

    #[test]
    fn test_rewrite_replaces_prefix() {
        let mut loc = location("api", vec![], vec!["/api"]);
        loc.rewrites.insert("/api".to_string(), "/v2".to_string());
        assert_eq!("/v2/users", Router::rewrite_path(&loc, "/api/users"));
    }
}
