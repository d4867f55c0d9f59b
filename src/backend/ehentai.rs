//! E-Hentai style galleries.

use regex::Regex;
use std::sync::LazyLock;

use super::error::{PipelineError, Result};
use super::gallery::{GalleryDetail, GalleryRef, GallerySource, PageDocument};

static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<h1 id="gn">([^<>]+)</h1>"#).expect("valid title regex"));
static SHOWING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Showing [\d,]+ - [\d,]+ of ([\d,]+) images").expect("valid showing regex")
});
static LENGTH_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Length:</td><td[^<>]*>([\d,]+) pages").expect("valid length regex")
});
static FIRST_PAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"href="([^"<>]*/s/[0-9a-f]+/\d+-1)""#).expect("valid first page regex")
});
static PREV_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<a[^<>]*id="prev"[^<>]*href="([^<>"]+)""#).expect("valid prev regex")
});
static NEXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<a[^<>]*id="next"[^<>]*href="([^<>"]+)""#).expect("valid next regex")
});
static IMG_TAG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"<img[^<>]*\bid="img"[^<>]*>"#).expect("valid img regex"));
static SRC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\bsrc="([^"]+)""#).expect("valid src regex"));

const GONE_MARKERS: &[&str] = &[
    "This gallery has been removed",
    "Gallery not found",
    "Key missing, or incorrect key provided",
];

pub struct EhSource {
    base_url: String,
}

impl EhSource {
    pub fn new(base_url: &str) -> Self {
        EhSource {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#039;", "'")
        .replace("&amp;", "&")
}

fn parse_count(text: &str) -> Option<usize> {
    text.replace(',', "").parse().ok()
}

fn capture(re: &Regex, body: &str) -> Option<String> {
    re.captures(body)
        .and_then(|c| c.get(1))
        .map(|m| unescape(m.as_str()))
}

impl GallerySource for EhSource {
    fn gallery_url(&self, gallery: &GalleryRef) -> String {
        format!("{}/g/{}/{}/", self.base_url, gallery.gid, gallery.token)
    }

    fn parse_gallery(&self, gallery: &GalleryRef, body: &str) -> Result<GalleryDetail> {
        if GONE_MARKERS.iter().any(|m| body.contains(m)) {
            return Err(PipelineError::GalleryGone(gallery.to_string()));
        }

        let total_pages = SHOWING_RE
            .captures(body)
            .or_else(|| LENGTH_RE.captures(body))
            .and_then(|c| c.get(1))
            .and_then(|m| parse_count(m.as_str()))
            .ok_or_else(|| PipelineError::Parse(format!("no page count for gallery {gallery}")))?;

        Ok(GalleryDetail {
            title: capture(&TITLE_RE, body)
                .map(|t| t.trim().to_string())
                .unwrap_or_else(|| gallery.gid.to_string()),
            total_pages,
            first_page_url: capture(&FIRST_PAGE_RE, body),
        })
    }

    fn page_document_url(&self, gallery: &GalleryRef, index: usize) -> String {
        format!(
            "{}/s/{}/{}-{}",
            self.base_url,
            gallery.token,
            gallery.gid,
            index + 1
        )
    }

    fn parse_page_document(&self, body: &str) -> Result<PageDocument> {
        let image_url = IMG_TAG_RE
            .find(body)
            .and_then(|tag| capture(&SRC_RE, tag.as_str()))
            .ok_or_else(|| PipelineError::Parse("page document has no image".to_string()))?;

        Ok(PageDocument {
            image_url,
            prev_url: capture(&PREV_RE, body),
            next_url: capture(&NEXT_RE, body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GALLERY: &str = r#"<div id="gd2"><h1 id="gn">Sample &amp; Title</h1><h1 id="gj"></h1></div>
<tr><td class="gdt1">Length:</td><td class="gdt2">24 pages</td></tr>
<p class="gpc">Showing 1 - 20 of 1,024 images</p>
<div id="gdt"><div class="gdtm" style="height:170px"><div style="margin:1px auto 0; width:100px; height:144px; background:transparent url(https://t.example/m.jpg) -0px 0 no-repeat"><a href="https://e-hentai.org/s/4f3a2b1c9d/123456-1"><img alt="01" title="Page 1: 001.jpg" src="https://e-hentai.org/g/blank.gif"></a></div></div>
<div class="gdtm"><a href="https://e-hentai.org/s/9e8d7c6b5a/123456-2"><img alt="02"></a></div></div>"#;

    const PAGE: &str = r#"<div id="i2"><div class="sn"><a onclick="return load_image(1, 'aaa')" href="https://e-hentai.org/s/aaa/123456-1"><img src="https://ehgt.org/g/f.png" /></a><a id="prev" onclick="return load_image(1, 'aaa')" href="https://e-hentai.org/s/aaa/123456-1"><img src="https://ehgt.org/g/p.png" /></a><div><span>2</span> / <span>24</span></div><a id="next" onclick="return load_image(3, 'ccc')" href="https://e-hentai.org/s/ccc/123456-3"><img src="https://ehgt.org/g/n.png" /></a></div></div>
<div id="i3"><a onclick="return load_image(3, 'ccc')" href="https://e-hentai.org/s/ccc/123456-3"><img id="img" src="https://abc.hath.network/h/keystamp=1;fileindex=2&amp;xres=org/002.png" style="height:1200px;width:850px" onerror="this.onerror=null; nl('x')" /></a></div>"#;

    #[test]
    fn builds_urls_from_the_base() {
        let source = EhSource::new("https://e-hentai.org/");
        let gallery = GalleryRef::new(123456, "0a1b2c3d4e");
        assert_eq!(source.gallery_url(&gallery), "https://e-hentai.org/g/123456/0a1b2c3d4e/");
        assert_eq!(
            source.page_document_url(&gallery, 0),
            "https://e-hentai.org/s/0a1b2c3d4e/123456-1"
        );
    }

    #[test]
    fn reads_gallery_detail() {
        let source = EhSource::new("https://e-hentai.org");
        let detail = source
            .parse_gallery(&GalleryRef::new(123456, "0a1b2c3d4e"), GALLERY)
            .unwrap();
        assert_eq!(detail.title, "Sample & Title");
        assert_eq!(detail.total_pages, 1024);
        assert_eq!(
            detail.first_page_url.as_deref(),
            Some("https://e-hentai.org/s/4f3a2b1c9d/123456-1")
        );
    }

    #[test]
    fn length_row_is_a_fallback_count() {
        let source = EhSource::new("https://e-hentai.org");
        let body = r#"<tr><td class="gdt1">Length:</td><td class="gdt2">7 pages</td></tr>"#;
        let detail = source.parse_gallery(&GalleryRef::new(1, "t"), body).unwrap();
        assert_eq!(detail.total_pages, 7);
        assert_eq!(detail.title, "1");
        assert_eq!(detail.first_page_url, None);
    }

    #[test]
    fn removed_gallery_is_gone() {
        let source = EhSource::new("https://e-hentai.org");
        let body = "<div class=\"d\">\n<p>This gallery has been removed or is unavailable.</p>";
        let err = source.parse_gallery(&GalleryRef::new(1, "t"), body).unwrap_err();
        assert!(matches!(err, PipelineError::GalleryGone(_)));
        assert!(err.is_structural());
    }

    #[test]
    fn reads_page_document_and_unescapes_image() {
        let doc = EhSource::new("https://e-hentai.org").parse_page_document(PAGE).unwrap();
        assert_eq!(
            doc.image_url,
            "https://abc.hath.network/h/keystamp=1;fileindex=2&xres=org/002.png"
        );
        assert_eq!(doc.prev_url.as_deref(), Some("https://e-hentai.org/s/aaa/123456-1"));
        assert_eq!(doc.next_url.as_deref(), Some("https://e-hentai.org/s/ccc/123456-3"));
    }

    #[test]
    fn page_without_image_is_a_parse_error() {
        let err = EhSource::new("https://e-hentai.org")
            .parse_page_document("<html>509 bandwidth exceeded</html>")
            .unwrap_err();
        assert!(matches!(err, PipelineError::Parse(_)));
        assert!(err.is_transient());
    }
}
