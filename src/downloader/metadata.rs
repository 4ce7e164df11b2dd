// 远程文件信息探测

use anyhow::{Context, Result};
use regex::Regex;
use reqwest::header::{
    HeaderMap, HeaderName, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE,
    RANGE,
};
use reqwest::{Client, StatusCode, Url};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// 无法确定文件名时的默认值
const FALLBACK_FILENAME: &str = "download";

/// 远程文件信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileInfo {
    /// 重定向后的最终地址
    pub url: String,
    pub filename: String,
    /// 文件大小，0 表示未知
    pub file_size: u64,
    /// 是否支持 Range 续传
    pub resumable: bool,
    pub content_type: Option<String>,
}

/// 探测远程文件信息
///
/// 先发 HEAD；HEAD 失败或没有给出大小时，用 `Range: bytes=0-0` 的 GET 再探一次
pub async fn fetch_remote_info(
    client: &Client,
    url: &str,
    timeout: Duration,
) -> Result<RemoteFileInfo> {
    let head_info = match client.head(url).timeout(timeout).send().await {
        Ok(resp) if resp.status().is_success() => {
            let info = info_from_headers(resp.url(), resp.headers());
            if info.file_size > 0 {
                info!(
                    "获取文件信息成功: {} ({} bytes, 续传: {})",
                    info.filename, info.file_size, info.resumable
                );
                return Ok(info);
            }
            debug!("HEAD 未返回文件大小，改用 Range 探测: {}", url);
            Some(info)
        }
        Ok(resp) => {
            debug!("HEAD 返回 {}，改用 Range 探测: {}", resp.status(), url);
            None
        }
        Err(e) => {
            debug!("HEAD 请求失败: {}，改用 Range 探测: {}", e, url);
            None
        }
    };

    match probe_with_range(client, url, timeout).await {
        Ok(info) => {
            info!(
                "获取文件信息成功(Range 探测): {} ({} bytes, 续传: {})",
                info.filename, info.file_size, info.resumable
            );
            Ok(info)
        }
        // HEAD 成功但没有大小，按未知大小下载
        Err(e) => match head_info {
            Some(info) => {
                debug!("Range 探测失败: {}，按未知大小处理", e);
                Ok(info)
            }
            None => Err(e),
        },
    }
}

async fn probe_with_range(client: &Client, url: &str, timeout: Duration) -> Result<RemoteFileInfo> {
    let resp = client
        .get(url)
        .header(RANGE, "bytes=0-0")
        .timeout(timeout)
        .send()
        .await
        .with_context(|| format!("探测文件信息失败: {}", url))?;

    let status = resp.status();
    let mut info = info_from_headers(resp.url(), resp.headers());

    match status {
        StatusCode::PARTIAL_CONTENT => {
            info.resumable = true;
            info.file_size = resp
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
                .unwrap_or(0);
        }
        // 服务器忽略了 Range，Content-Length 就是完整大小
        StatusCode::OK => info.resumable = false,
        other => anyhow::bail!("探测文件信息失败: HTTP {}", other.as_u16()),
    }

    // 不读取响应体，直接丢弃连接
    drop(resp);
    Ok(info)
}

fn info_from_headers(final_url: &Url, headers: &HeaderMap) -> RemoteFileInfo {
    let header_str = |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok());

    let file_size = header_str(CONTENT_LENGTH)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(0);

    let resumable = header_str(ACCEPT_RANGES)
        .map(|v| v.trim().eq_ignore_ascii_case("bytes"))
        .unwrap_or(false);

    let filename = header_str(CONTENT_DISPOSITION)
        .and_then(filename_from_disposition)
        .or_else(|| filename_from_url(final_url))
        .unwrap_or_else(|| FALLBACK_FILENAME.to_string());

    RemoteFileInfo {
        url: final_url.to_string(),
        filename,
        file_size,
        resumable,
        content_type: header_str(CONTENT_TYPE).map(str::to_string),
    }
}

/// 解析 `bytes 0-0/12345` 中的总大小，`*` 返回 None
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

/// 从 Content-Disposition 提取文件名，`filename*=UTF-8''` 优先
pub fn filename_from_disposition(value: &str) -> Option<String> {
    let extended = Regex::new(r#"(?i)filename\*\s*=\s*UTF-8''([^;\s]+)"#).ok()?;
    if let Some(caps) = extended.captures(value) {
        if let Ok(decoded) = urlencoding::decode(&caps[1]) {
            if let Some(name) = sanitize_filename(&decoded) {
                return Some(name);
            }
        }
    }

    let plain = Regex::new(r#"(?i)filename\s*=\s*(?:"([^"]*)"|([^;]+))"#).ok()?;
    let caps = plain.captures(value)?;
    let raw = caps.get(1).or_else(|| caps.get(2))?.as_str();
    sanitize_filename(raw.trim().trim_matches('\''))
}

/// 取 URL 路径最后一段并做百分号解码
pub fn filename_from_url(url: &Url) -> Option<String> {
    let last = url.path_segments()?.last()?;
    let decoded = urlencoding::decode(last).ok()?;
    sanitize_filename(&decoded)
}

/// 去掉路径成分，拒绝空名和 `.`/`..`
fn sanitize_filename(name: &str) -> Option<String> {
    let name = name.rsplit(|c: char| c == '/' || c == '\\').next()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        None
    } else {
        Some(name.to_string())
    }
}

/// 目标文件已存在时选择 `name (1).ext`、`name (2).ext`……
pub fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let mut n = 1u32;
    loop {
        let candidate = parent.join(format!("{} ({}){}", stem, n, ext));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}
