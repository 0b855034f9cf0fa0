use thiserror::Error;
use url::Url;

const TRACKING_PARAMS: [&str; 7] = ["si", "feature", "pp", "fbclid", "gclid", "igshid", "igsh"];

const YOUTUBE_HOSTS: [&str; 4] = [
    "youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "youtube-nocookie.com",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LinkError {
    #[error("Please provide a URL.")]
    Empty,
    #[error("That does not look like a valid web address.")]
    Malformed,
    #[error("Only http and https links are supported.")]
    UnsupportedScheme,
}

/// Validates an untrusted URL and rewrites it into the form handed to the extraction engine.
pub fn normalize_url(input: &str) -> Result<Url, LinkError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(LinkError::Empty);
    }

    let mut url = Url::parse(input).map_err(|_| LinkError::Malformed)?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(LinkError::UnsupportedScheme);
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(LinkError::Malformed);
    }

    if let Some(video_id) = youtube_video_id(&url) {
        let start = url
            .query_pairs()
            .find(|(key, _)| key == "t")
            .map(|(_, value)| value.into_owned());

        let mut canonical =
            Url::parse("https://www.youtube.com/watch").map_err(|_| LinkError::Malformed)?;
        {
            let mut query = canonical.query_pairs_mut();
            query.append_pair("v", &video_id);
            if let Some(start) = start {
                query.append_pair("t", &start);
            }
        }
        return Ok(canonical);
    }

    let retained: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    if retained.is_empty() {
        url.set_query(None);
    } else {
        url.query_pairs_mut().clear().extend_pairs(retained);
    }

    Ok(url)
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}

fn youtube_video_id(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let mut segments = url.path_segments()?;

    let candidate = if host == "youtu.be" {
        segments.next().map(ToString::to_string)
    } else if YOUTUBE_HOSTS.contains(&host) {
        match segments.next()? {
            "watch" => url
                .query_pairs()
                .find(|(key, _)| key == "v")
                .map(|(_, value)| value.into_owned()),
            "shorts" | "live" | "embed" => segments.next().map(ToString::to_string),
            _ => None,
        }
    } else {
        None
    };

    candidate.filter(|id| is_video_id(id))
}

fn is_video_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 64
        && value
            .chars()
            .all(|character| character.is_ascii_alphanumeric() || matches!(character, '-' | '_'))
}
