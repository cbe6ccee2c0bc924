//! Sitemap generation for the published tree.

use chrono::{DateTime, SecondsFormat, Utc};

/// Render a sitemap for `pages`. `index.html` is listed first, the rest sorted.
pub fn render(base_url: &str, pages: &[String], lastmod: DateTime<Utc>) -> String {
    let base = base_url.trim_end_matches('/');
    let lastmod = lastmod.to_rfc3339_opts(SecondsFormat::Secs, true);

    let mut ordered = pages.to_vec();
    ordered.sort_by_key(|p| (p != "index.html", p.clone()));
    ordered.dedup();

    let mut xml = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<urlset xmlns=\"http://www.sitemaps.org/schemas/sitemap/0.9\">\n",
    );
    for page in ordered {
        xml.push_str("  <url>\n");
        xml.push_str(&format!("    <loc>{}</loc>\n", escape(&format!("{}/{}", base, page))));
        xml.push_str(&format!("    <lastmod>{}</lastmod>\n", lastmod));
        xml.push_str("    <changefreq>daily</changefreq>\n");
        xml.push_str("  </url>\n");
    }
    xml.push_str("</urlset>\n");
    xml
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_index_first_and_escaped() {
        let when = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let pages = vec![
            "pages/b&c.html".to_string(),
            "about.html".to_string(),
            "index.html".to_string(),
        ];
        let xml = render("https://example.test/", &pages, when);

        let index = xml.find("https://example.test/index.html").unwrap();
        let about = xml.find("https://example.test/about.html").unwrap();
        assert!(index < about);
        assert!(xml.contains("pages/b&amp;c.html"));
        assert!(xml.contains("<lastmod>2026-01-02T03:04:05Z</lastmod>"));
        assert_eq!(xml.matches("<url>").count(), 3);
    }
}
