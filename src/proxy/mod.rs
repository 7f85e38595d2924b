/// HLS Proxy
///
/// Rewrites master and variant playlists already produced by the Encoder
/// Driver so a player can stream from a private bucket through this
/// service instead of hitting the object store directly.
use regex::Regex;
use std::sync::OnceLock;

fn variant_uri_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^([A-Za-z0-9_-]+)/index\.m3u8$").expect("valid regex"))
}

fn segment_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^segment\d+\.ts$").expect("valid regex"))
}

/// Rewrite a fetched master playlist's variant URIs from
/// `{tag}/index.m3u8` to `{api_base}/hls/{output_prefix}/{tag}/playlist.m3u8`.
/// All other lines, including `#EXT...` tags, pass through unchanged.
pub fn rewrite_master(body: &str, api_base: &str, output_prefix: &str) -> String {
    let re = variant_uri_regex();
    let mut out = String::with_capacity(body.len());
    for line in body.lines() {
        if let Some(captures) = re.captures(line) {
            let tag = &captures[1];
            out.push_str(&format!(
                "{api_base}/hls/{output_prefix}/{tag}/playlist.m3u8"
            ));
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

/// Rewrite a fetched variant playlist's bare segment lines from
/// `segmentNNN.ts` to `{api_base}/hls/{output_prefix}/{tag}/segmentNNN.ts`.
/// `#EXT...` tags are preserved verbatim.
pub fn rewrite_variant(body: &str, api_base: &str, output_prefix: &str, tag: &str) -> String {
    let re = segment_line_regex();
    let mut out = String::with_capacity(body.len());
    for line in body.lines() {
        if re.is_match(line) {
            out.push_str(&format!("{api_base}/hls/{output_prefix}/{tag}/{line}"));
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_master_variant_uris() {
        let body = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=896000,RESOLUTION=640x360\n360p/index.m3u8\n";
        let rewritten = rewrite_master(body, "https://api.example.com", "P");
        assert_eq!(
            rewritten,
            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=896000,RESOLUTION=640x360\nhttps://api.example.com/hls/P/360p/playlist.m3u8\n"
        );
    }

    #[test]
    fn rewrites_variant_segment_lines_matching_spec_scenario() {
        let body = "#EXTM3U\n#EXTINF:15.0,\nsegment000.ts\nsegment001.ts\n#EXT-X-ENDLIST\n";
        let rewritten = rewrite_variant(body, "https://api.example.com", "P", "360p");
        assert_eq!(
            rewritten,
            "#EXTM3U\n#EXTINF:15.0,\nhttps://api.example.com/hls/P/360p/segment000.ts\nhttps://api.example.com/hls/P/360p/segment001.ts\n#EXT-X-ENDLIST\n"
        );
    }

    #[test]
    fn leaves_non_matching_lines_untouched() {
        let body = "#EXTM3U\nnot-a-segment-line\n";
        let rewritten = rewrite_variant(body, "https://api.example.com", "P", "360p");
        assert_eq!(rewritten, body);
    }
}
