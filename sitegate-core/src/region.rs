//! Region Locator - Marker-Delimited Mutable Ranges
//!
//! A region is located once and handed around as a [`LocatedRegion`].
//! Call sites never do their own index arithmetic on marker positions.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Start/end marker pair delimiting the mutable part of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Region {
    pub start_marker: String,
    pub end_marker: String,
}

impl Region {
    pub fn new(start_marker: impl Into<String>, end_marker: impl Into<String>) -> Self {
        Self {
            start_marker: start_marker.into(),
            end_marker: end_marker.into(),
        }
    }

    /// The first marker of this pair that occurs in `text`, if any.
    pub fn marker_in(&self, text: &str) -> Option<&str> {
        [&self.start_marker, &self.end_marker]
            .into_iter()
            .find(|m| text.contains(m.as_str()))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegionError {
    #[error("marker {marker:?} not found")]
    Missing { marker: String },

    #[error("{reason}")]
    Malformed { reason: String },
}

/// A document split around a region. The markers themselves are not part of any slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocatedRegion<'a> {
    pub before: &'a str,
    pub mutable: &'a str,
    pub after: &'a str,
    region: &'a Region,
}

impl<'a> LocatedRegion<'a> {
    /// Rebuild the document with `replacement` between the existing markers.
    pub fn splice(&self, replacement: &str) -> String {
        let mut out = String::with_capacity(
            self.before.len()
                + self.region.start_marker.len()
                + replacement.len()
                + self.region.end_marker.len()
                + self.after.len(),
        );
        out.push_str(self.before);
        out.push_str(&self.region.start_marker);
        out.push_str(replacement);
        out.push_str(&self.region.end_marker);
        out.push_str(self.after);
        out
    }
}

/// Locate `region` in `document`. Both markers must occur exactly once, start first.
pub fn locate<'a>(document: &'a str, region: &'a Region) -> Result<LocatedRegion<'a>, RegionError> {
    let start = find_unique(document, &region.start_marker)?;
    let end = find_unique(document, &region.end_marker)?;

    let content_start = start + region.start_marker.len();
    if end < content_start {
        return Err(RegionError::Malformed {
            reason: format!(
                "end marker {:?} precedes start marker {:?}",
                region.end_marker, region.start_marker
            ),
        });
    }

    Ok(LocatedRegion {
        before: &document[..start],
        mutable: &document[content_start..end],
        after: &document[end + region.end_marker.len()..],
        region,
    })
}

fn find_unique(document: &str, marker: &str) -> Result<usize, RegionError> {
    let mut hits = document.match_indices(marker).map(|(i, _)| i);
    let first = hits.next().ok_or_else(|| RegionError::Missing {
        marker: marker.to_string(),
    })?;
    let extra = hits.count();
    if extra > 0 {
        return Err(RegionError::Malformed {
            reason: format!("marker {:?} occurs {} times", marker, extra + 1),
        });
    }
    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> Region {
        Region::new("START", "END")
    }

    #[test]
    fn test_locate_returns_three_slices() {
        let region = markers();
        let doc = "head START marker content END tail";
        let located = locate(doc, &region).unwrap();
        assert_eq!(located.before, "head ");
        assert_eq!(located.mutable, " marker content ");
        assert_eq!(located.after, " tail");
    }

    #[test]
    fn test_end_before_start_is_malformed() {
        let region = markers();
        let err = locate("END middle START", &region).unwrap_err();
        assert!(matches!(err, RegionError::Malformed { .. }));
    }

    #[test]
    fn test_missing_marker() {
        let region = markers();
        let err = locate("START only", &region).unwrap_err();
        assert_eq!(err, RegionError::Missing { marker: "END".to_string() });
    }

    #[test]
    fn test_duplicate_marker_is_malformed() {
        let region = markers();
        let err = locate("START a END b START", &region).unwrap_err();
        match err {
            RegionError::Malformed { reason } => assert!(reason.contains("2 times")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_splice_keeps_markers_and_surroundings() {
        let region = Region::new("<!--R-START-->", "<!--R-END-->");
        let doc = "<body><!--R-START--><!--R-END--><footer>Created by X</footer></body>";
        let spliced = locate(doc, &region).unwrap().splice("<section>new</section>");
        assert_eq!(
            spliced,
            "<body><!--R-START--><section>new</section><!--R-END--><footer>Created by X</footer></body>"
        );
    }

    #[test]
    fn test_marker_in() {
        let region = markers();
        assert_eq!(region.marker_in("a END b"), Some("END"));
        assert_eq!(region.marker_in("plain"), None);
    }
}
