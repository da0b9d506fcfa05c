pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Everything before the first `.fits`, or the name up to its last
/// extension when it has none
pub fn frame_stem(name: &str) -> &str {
    match name.find(".fits") {
        Some(pos) => &name[..pos],
        None => name.rsplit_once('.').map_or(name, |(stem, _)| stem),
    }
}

/// `<stem><suffix>.fits`
pub fn derived_fits_name(stem: &str, suffix: &str) -> String {
    format!("{}{}.fits", stem, suffix)
}

/// Last path component, accepting either separator
pub fn extract_filename(path: &str) -> &str {
    path.split(&['\\', '/'][..]).next_back().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_string_short() {
        assert_eq!(truncate_string("hello", 10), "hello");
        assert_eq!(truncate_string("test", 4), "test");
        assert_eq!(truncate_string("", 10), "");
    }

    #[test]
    fn test_truncate_string_long() {
        assert_eq!(truncate_string("hello world", 8), "hello...");
        assert_eq!(truncate_string("1234567890", 5), "12...");
        assert_eq!(truncate_string("abcd", 3), "...");
    }

    #[test]
    fn test_truncate_string_multibyte() {
        assert_eq!(truncate_string("ééééé", 4), "é...");
    }

    #[test]
    fn test_frame_stem() {
        assert_eq!(frame_stem("a_001.fits"), "a_001");
        assert_eq!(frame_stem("a_001.fits.fz"), "a_001");
        assert_eq!(frame_stem("a_001_ds_ff.fits"), "a_001_ds_ff");
        assert_eq!(frame_stem("catalogue.cat"), "catalogue");
        assert_eq!(frame_stem("plain"), "plain");
    }

    #[test]
    fn test_derived_fits_name() {
        assert_eq!(
            derived_fits_name("a_ds_ff_photo", "_convto17.6"),
            "a_ds_ff_photo_convto17.6.fits"
        );
    }

    #[test]
    fn test_extract_filename() {
        assert_eq!(extract_filename("/home/user/images/test.fits"), "test.fits");
        assert_eq!(extract_filename("C:\\Users\\User\\image.fit"), "image.fit");
        assert_eq!(extract_filename("simple.fits"), "simple.fits");
    }
}
