// src/uri.rs
//
// Bus URI parsing. Strips the control/formatting suffixes off an incoming
// uri and splits the remainder into path segments, so the dispatcher can
// resolve `/<base>/<component>[/<point>]` plus request flags.

/// A parsed bus URI: suffix flags plus the remaining path segments.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct UriRequest {
    pub is_raw_request: bool,
    pub is_timings_request: bool,
    pub is_reset_timings_request: bool,
    pub is_reload_request: bool,
    pub is_enable_request: bool,
    pub is_disable_request: bool,
    pub is_force_request: bool,
    pub is_unforce_request: bool,
    /// Path segments with the leading empty segment removed:
    /// `/comps/bms/soc` → `["comps", "bms", "soc"]`
    pub segments: Vec<String>,
}

const RAW_SUFFIX: &str = "/_raw";
const TIMINGS_SUFFIX: &str = "/_timings";
const RESET_TIMINGS_SUFFIX: &str = "/_reset_timings";
const RELOAD_SUFFIX: &str = "/_reload";
const ENABLE_SUFFIX: &str = "/_enable";
const DISABLE_SUFFIX: &str = "/_disable";
const FORCE_SUFFIX: &str = "/_force";
const UNFORCE_SUFFIX: &str = "/_unforce";

impl UriRequest {
    pub fn parse(uri: &str) -> Self {
        let mut req = UriRequest::default();
        let mut rest = uri;

        let mut strip = |flag: &mut bool, suffix: &str, rest: &mut &str| {
            if let Some(stripped) = rest.strip_suffix(suffix) {
                *flag = true;
                *rest = stripped;
            }
        };

        strip(&mut req.is_raw_request, RAW_SUFFIX, &mut rest);
        strip(&mut req.is_timings_request, TIMINGS_SUFFIX, &mut rest);
        strip(&mut req.is_reset_timings_request, RESET_TIMINGS_SUFFIX, &mut rest);
        strip(&mut req.is_reload_request, RELOAD_SUFFIX, &mut rest);
        strip(&mut req.is_enable_request, ENABLE_SUFFIX, &mut rest);
        strip(&mut req.is_disable_request, DISABLE_SUFFIX, &mut rest);
        strip(&mut req.is_force_request, FORCE_SUFFIX, &mut rest);
        strip(&mut req.is_unforce_request, UNFORCE_SUFFIX, &mut rest);

        req.segments = rest
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        req
    }

    /// Any control suffix that modifies point/component state rather than
    /// requesting data.
    pub fn is_control_request(&self) -> bool {
        self.is_reload_request
            || self.is_enable_request
            || self.is_disable_request
            || self.is_force_request
            || self.is_unforce_request
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_component_uri() {
        let req = UriRequest::parse("/comps/bms");
        assert_eq!(req.segments, vec!["comps", "bms"]);
        assert!(!req.is_raw_request);
        assert!(!req.is_control_request());
    }

    #[test]
    fn test_point_uri_with_raw_suffix() {
        let req = UriRequest::parse("/comps/bms/soc/_raw");
        assert!(req.is_raw_request);
        assert_eq!(req.segments, vec!["comps", "bms", "soc"]);
    }

    #[test]
    fn test_reload_suffix() {
        let req = UriRequest::parse("/comps/bms/_reload");
        assert!(req.is_reload_request);
        assert!(req.is_control_request());
        assert_eq!(req.segments, vec!["comps", "bms"]);
    }

    #[test]
    fn test_timings_and_reset_timings_are_distinct() {
        let t = UriRequest::parse("/comps/bms/_timings");
        assert!(t.is_timings_request && !t.is_reset_timings_request);
        let r = UriRequest::parse("/comps/bms/_reset_timings");
        assert!(r.is_reset_timings_request && !r.is_timings_request);
        assert_eq!(r.segments, vec!["comps", "bms"]);
    }

    #[test]
    fn test_force_unforce() {
        assert!(UriRequest::parse("/comps/bms/soc/_force").is_force_request);
        assert!(UriRequest::parse("/comps/bms/soc/_unforce").is_unforce_request);
    }
}
