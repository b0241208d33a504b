//! User-Agent classification for the adaptive m3u8 counter.
//!
//! Pattern-based: fixed case-insensitive substring lists, evaluated
//! tool → mobile → desktop with the first match winning. An unmatched
//! agent is treated as a tool, which carries the strictest limit.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrowserClass {
    MobileBrowser,
    DesktopBrowser,
    ToolOrDownloader,
}

impl BrowserClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrowserClass::MobileBrowser => "mobile_browser",
            BrowserClass::DesktopBrowser => "desktop_browser",
            BrowserClass::ToolOrDownloader => "tool_or_downloader",
        }
    }
}

const TOOL_MARKERS: &[&str] = &[
    "wget", "curl", "aria2", "axel", "youtube-dl", "yt-dlp", "ffmpeg", "vlc", "mpv", "idm",
    "thunder", "bitcomet", "utorrent", "qbittorrent", "transmission", "deluge", "flashget",
    "freedownloadmanager", "eagleget", "python-requests", "urllib", "httplib", "go-http-client",
    "node-fetch", "axios", "okhttp",
];

const MOBILE_MARKERS: &[&str] = &[
    "mobile", "android", "iphone", "ipad", "qqbrowser", "mqqbrowser", "ucbrowser", "ucweb",
    "baiduboxapp", "sogoumobilebrowser", "edga/", "edgios/", "fxios/",
];

const DESKTOP_MARKERS: &[&str] = &[
    "windows nt", "macintosh", "x11; linux", "cros", "chrome/", "firefox/", "safari/", "edg/",
    "opr/", "opera/", "mozilla",
];

pub fn detect(user_agent: &str) -> BrowserClass {
    if user_agent.is_empty() {
        return BrowserClass::ToolOrDownloader;
    }
    let ua = user_agent.to_lowercase();

    if TOOL_MARKERS.iter().any(|m| ua.contains(m)) {
        return BrowserClass::ToolOrDownloader;
    }
    if MOBILE_MARKERS.iter().any(|m| ua.contains(m)) {
        return BrowserClass::MobileBrowser;
    }
    if DESKTOP_MARKERS.iter().any(|m| ua.contains(m)) {
        return BrowserClass::DesktopBrowser;
    }
    BrowserClass::ToolOrDownloader
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tools_win_over_everything() {
        assert_eq!(detect("curl/8.4.0"), BrowserClass::ToolOrDownloader);
        assert_eq!(detect("Wget/1.21"), BrowserClass::ToolOrDownloader);
        // A tool marker inside a browser-looking UA still classifies as tool.
        assert_eq!(
            detect("Mozilla/5.0 okhttp/4.12.0"),
            BrowserClass::ToolOrDownloader
        );
    }

    #[test]
    fn test_mobile_before_desktop() {
        assert_eq!(
            detect("Mozilla/5.0 (Linux; Android 14) Chrome/120.0 Mobile Safari/537.36"),
            BrowserClass::MobileBrowser
        );
        assert_eq!(
            detect("Mozilla/5.0 (iPhone; CPU iPhone OS 17_0 like Mac OS X) Safari/604.1"),
            BrowserClass::MobileBrowser
        );
    }

    #[test]
    fn test_desktop() {
        assert_eq!(
            detect("Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/120.0 Safari/537.36"),
            BrowserClass::DesktopBrowser
        );
        assert_eq!(
            detect("Mozilla/5.0 (X11; Linux x86_64; rv:121.0) Firefox/121.0"),
            BrowserClass::DesktopBrowser
        );
    }

    #[test]
    fn test_unknown_defaults_to_tool() {
        assert_eq!(detect(""), BrowserClass::ToolOrDownloader);
        assert_eq!(detect("SomePlayer/1.0"), BrowserClass::ToolOrDownloader);
    }
}
