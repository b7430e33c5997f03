use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chardetng::EncodingDetector;
use encoding_rs::{Encoding, UTF_8, UTF_16BE, UTF_16LE};
use regex::{Captures, Regex};

use crate::perms::ensure_writable;

const URL_ATTRIBUTE_PATTERN: &str =
    r#"(?is)(\s)(href|src|action|cite|archive|codebase|code|data|ismap|usemap|longdesc)="(.*?)""#;

pub struct UrlRewriter {
    pattern: Regex,
    override_encoding: Option<&'static Encoding>,
}

impl UrlRewriter {
    pub fn new(encoding_label: Option<&str>) -> Result<Self> {
        let override_encoding = match encoding_label {
            Some(label) => {
                let trimmed = label.trim();
                let encoding = Encoding::for_label(trimmed.as_bytes())
                    .ok_or_else(|| anyhow!("unknown encoding override '{trimmed}'"))?;
                Some(encoding)
            }
            None => None,
        };
        let pattern = Regex::new(URL_ATTRIBUTE_PATTERN)
            .map_err(|err| anyhow!("invalid attribute pattern: {err}"))?;
        Ok(Self {
            pattern,
            override_encoding,
        })
    }

    pub fn rewrite_file(&self, path: &Path, apply: bool) -> Result<usize> {
        let _guard = if apply {
            Some(ensure_writable(path)?)
        } else {
            None
        };

        let bytes =
            fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let encoding = self
            .override_encoding
            .unwrap_or_else(|| detect_encoding(&bytes));
        let (text, _, had_errors) = encoding.decode(&bytes);
        if had_errors {
            println!(
                "warning: decoding errors encountered for {}; continuing",
                path.display()
            );
        }

        let (rewritten, changed) = self.rewrite_text(&text);
        if changed == 0 || !apply {
            return Ok(changed);
        }

        let (encoded, _, unmappable) = encoding.encode(&rewritten);
        if unmappable {
            println!(
                "warning: encoding fallback occurred when writing {}; output may be lossy",
                path.display()
            );
        }
        let perms = fs::metadata(path)
            .with_context(|| format!("reading metadata for {}", path.display()))?
            .permissions();
        write_via_temp(path, encoded.as_ref(), perms)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(changed)
    }

    pub fn rewrite_text(&self, text: &str) -> (String, usize) {
        let mut changed = 0usize;
        let rewritten = self.pattern.replace_all(text, |caps: &Captures<'_>| {
            let value = &caps[3];
            let lowered = value.to_lowercase();
            if lowered != value {
                changed += 1;
            }
            format!("{}{}=\"{lowered}\"", &caps[1], &caps[2])
        });
        (rewritten.into_owned(), changed)
    }
}

fn detect_encoding(bytes: &[u8]) -> &'static Encoding {
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        return UTF_8;
    }
    if bytes.starts_with(&[0xFF, 0xFE]) {
        return UTF_16LE;
    }
    if bytes.starts_with(&[0xFE, 0xFF]) {
        return UTF_16BE;
    }
    if std::str::from_utf8(bytes).is_ok() {
        return UTF_8;
    }

    let mut detector = EncodingDetector::new();
    detector.feed(bytes, true);
    detector.guess(None, true)
}

fn write_via_temp(path: &Path, data: &[u8], perms: fs::Permissions) -> Result<()> {
    let base_dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let unique = format!(
        ".linklower-tmp-{}-{}",
        std::process::id(),
        time::OffsetDateTime::now_utc().unix_timestamp_nanos()
    );
    let temp_path = base_dir.join(unique);
    {
        let mut file = fs::File::create(&temp_path)
            .with_context(|| format!("creating temp file {}", temp_path.display()))?;
        file.write_all(data)
            .with_context(|| format!("writing temp file {}", temp_path.display()))?;
        file.sync_all()
            .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    }
    fs::set_permissions(&temp_path, perms)
        .with_context(|| format!("setting permissions on {}", temp_path.display()))?;
    fs::rename(&temp_path, path).or_else(|err| {
        let _ = fs::remove_file(&temp_path);
        Err(err).with_context(|| format!("replacing {}", path.display()))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rewriter() -> UrlRewriter {
        UrlRewriter::new(None).expect("rewriter")
    }

    #[test]
    fn value_lowercased_attribute_case_preserved() {
        let (out, changed) = rewriter().rewrite_text(r#"<img SRC="Images/Pic.PNG">"#);
        assert_eq!(out, r#"<img SRC="images/pic.png">"#);
        assert_eq!(changed, 1);
    }

    #[test]
    fn tag_names_and_body_text_untouched() {
        let input = "<DIV CLASS=\"Box\">Read The MANUAL <a href=\"Docs/Index.HTM\">here</a></DIV>";
        let (out, changed) = rewriter().rewrite_text(input);
        assert_eq!(
            out,
            "<DIV CLASS=\"Box\">Read The MANUAL <a href=\"docs/index.htm\">here</a></DIV>"
        );
        assert_eq!(changed, 1);
    }

    #[test]
    fn multiline_value_is_matched() {
        let input = "<a href=\"Docs/\nPage.HTML\">x</a>";
        let (out, changed) = rewriter().rewrite_text(input);
        assert_eq!(out, "<a href=\"docs/\npage.html\">x</a>");
        assert_eq!(changed, 1);
    }

    #[test]
    fn every_recognized_attribute_is_rewritten() {
        let attrs = [
            "href", "src", "action", "cite", "archive", "codebase", "code", "data", "ismap",
            "usemap", "longdesc",
        ];
        for attr in attrs {
            let input = format!("<x {attr}=\"VALUE\">");
            let (out, changed) = rewriter().rewrite_text(&input);
            assert_eq!(out, format!("<x {attr}=\"value\">"), "attribute {attr}");
            assert_eq!(changed, 1, "attribute {attr}");
        }
    }

    #[test]
    fn codebase_is_not_shadowed_by_code() {
        let (out, changed) = rewriter().rewrite_text("<applet codebase=\"Java/Libs\">");
        assert_eq!(out, "<applet codebase=\"java/libs\">");
        assert_eq!(changed, 1);
    }

    #[test]
    fn single_quoted_and_unquoted_values_untouched() {
        let input = "<a href='Page.HTML'>x</a> <img src=Pic.PNG>";
        let (out, changed) = rewriter().rewrite_text(input);
        assert_eq!(out, input);
        assert_eq!(changed, 0);
    }

    #[test]
    fn attribute_without_leading_whitespace_untouched() {
        let input = "xhref=\"Page.HTML\"";
        let (out, changed) = rewriter().rewrite_text(input);
        assert_eq!(out, input);
        assert_eq!(changed, 0);
    }

    #[test]
    fn already_lowercase_counts_as_unchanged() {
        let (out, changed) = rewriter().rewrite_text("<a href=\"docs/page.html\">x</a>");
        assert_eq!(out, "<a href=\"docs/page.html\">x</a>");
        assert_eq!(changed, 0);
    }

    #[test]
    fn file_without_matches_is_left_byte_identical() {
        let temp = tempdir().expect("temp dir");
        let file = temp.path().join("plain.html");
        fs::write(&file, "<p>No Links Here</p>").expect("write file");

        let changed = rewriter().rewrite_file(&file, true).expect("rewrite");
        assert_eq!(changed, 0);
        assert_eq!(
            fs::read(&file).expect("read file"),
            b"<p>No Links Here</p>"
        );
    }

    #[test]
    fn file_with_matches_is_rewritten_in_place() {
        let temp = tempdir().expect("temp dir");
        let file = temp.path().join("index.html");
        fs::write(&file, "<a HREF=\"Sub/Page.HTML\">go</a>").expect("write file");

        let changed = rewriter().rewrite_file(&file, true).expect("rewrite");
        assert_eq!(changed, 1);
        let out = fs::read_to_string(&file).expect("read file");
        assert_eq!(out, "<a HREF=\"sub/page.html\">go</a>");
    }

    #[test]
    fn dry_run_reports_but_does_not_write() {
        let temp = tempdir().expect("temp dir");
        let file = temp.path().join("index.html");
        fs::write(&file, "<a href=\"Page.HTML\">go</a>").expect("write file");

        let changed = rewriter().rewrite_file(&file, false).expect("rewrite");
        assert_eq!(changed, 1);
        let out = fs::read_to_string(&file).expect("read file");
        assert_eq!(out, "<a href=\"Page.HTML\">go</a>");
    }

    #[test]
    fn unknown_encoding_override_is_rejected() {
        assert!(UrlRewriter::new(Some("not-a-charset")).is_err());
    }

    #[test]
    fn non_utf8_content_roundtrips_through_detected_encoding() {
        let temp = tempdir().expect("temp dir");
        let file = temp.path().join("latin.html");
        // ISO-8859-1: 0xE9 is 'é' in the body text, plus one uppercase link.
        let mut bytes = b"<a href=\"Caf\xE9/Menu.HTML\">caf\xE9</a>".to_vec();
        bytes.push(b'\n');
        fs::write(&file, &bytes).expect("write file");

        let rewriter = UrlRewriter::new(Some("iso-8859-1")).expect("rewriter");
        let changed = rewriter.rewrite_file(&file, true).expect("rewrite");
        assert_eq!(changed, 1);
        let out = fs::read(&file).expect("read file");
        assert_eq!(out, b"<a href=\"caf\xE9/menu.html\">caf\xE9</a>\n".to_vec());
    }
}