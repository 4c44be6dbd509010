//! Device family classification into the four delivery classes.

use adserve_core::types::DeviceClass;

/// Device-family tokens that decide a class on their own. Kept short on
/// purpose: the long tail of handset families ("Samsung SM-G950F" and
/// friends) carries no useful keyword, so everything not named here is
/// classified by operating system instead.
const TABLET_TOKENS: &[&str] = &["ipad", "tablet", "kindle", "surface", "playbook"];
const MOBILE_TOKENS: &[&str] = &["iphone", "ipod", "phone", "smartphone", "mobile"];

/// Map parser device/os families to `(class, is_bot)`.
///
/// The device family string is split into lowercase alphanumeric tokens
/// and checked against the token tables; when no token decides (desktop
/// user agents mostly parse to a device family of "Other"), the OS family
/// settles desktop versus mobile.
pub fn classify_device(device_family: &str, os_family: &str) -> (DeviceClass, bool) {
    let tokens: Vec<String> = device_family
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect();

    if tokens.iter().any(|t| is_bot_token(t)) {
        return (DeviceClass::Other, true);
    }
    if tokens.iter().any(|t| TABLET_TOKENS.contains(&t.as_str())) {
        return (DeviceClass::Tablet, false);
    }
    if tokens.iter().any(|t| MOBILE_TOKENS.contains(&t.as_str())) {
        return (DeviceClass::Mobile, false);
    }

    (class_from_os(os_family), false)
}

/// Crawler names are open-ended, so this matches shapes rather than a
/// list: the uap "Spider" family, anything ending in "bot" (Googlebot,
/// YandexBot, robot) and any "crawl"-derived name.
fn is_bot_token(token: &str) -> bool {
    token == "spider" || token.ends_with("bot") || token.starts_with("crawl")
}

fn class_from_os(os_family: &str) -> DeviceClass {
    let os = os_family.trim().to_lowercase();
    match os.as_str() {
        "ios" | "android" | "fire os" | "windows phone" | "kaios" => DeviceClass::Mobile,
        "chrome os" | "linux" | "ubuntu" | "fedora" | "debian" | "freebsd" => {
            DeviceClass::Desktop
        }
        _ if os.starts_with("windows") => DeviceClass::Desktop,
        _ if os.starts_with("mac os") => DeviceClass::Desktop,
        _ => DeviceClass::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apple_families() {
        assert_eq!(classify_device("iPhone", "iOS"), (DeviceClass::Mobile, false));
        assert_eq!(classify_device("iPad", "iOS"), (DeviceClass::Tablet, false));
    }

    #[test]
    fn test_desktop_falls_back_to_os() {
        assert_eq!(
            classify_device("Other", "Windows"),
            (DeviceClass::Desktop, false)
        );
        assert_eq!(
            classify_device("Other", "Mac OS X"),
            (DeviceClass::Desktop, false)
        );
        assert_eq!(
            classify_device("Other", "Chrome OS"),
            (DeviceClass::Desktop, false)
        );
    }

    #[test]
    fn test_handsets_classified_by_os() {
        // Handset families carry no keyword; Android decides.
        assert_eq!(
            classify_device("Samsung SM-G950F", "Android"),
            (DeviceClass::Mobile, false)
        );
        assert_eq!(
            classify_device("Other", "Android"),
            (DeviceClass::Mobile, false)
        );
    }

    #[test]
    fn test_generic_families_tokenize() {
        assert_eq!(
            classify_device("Generic Smartphone", "Other"),
            (DeviceClass::Mobile, false)
        );
        assert_eq!(
            classify_device("Generic Tablet", "Android"),
            (DeviceClass::Tablet, false)
        );
        assert_eq!(
            classify_device("Kindle", "Android"),
            (DeviceClass::Tablet, false)
        );
    }

    #[test]
    fn test_bots() {
        assert_eq!(classify_device("Spider", ""), (DeviceClass::Other, true));
        assert_eq!(
            classify_device("YandexBot", "Other"),
            (DeviceClass::Other, true)
        );
        assert_eq!(
            classify_device("AhrefsBot Crawler", ""),
            (DeviceClass::Other, true)
        );
        // "bot" must end a token, not merely appear in one.
        assert_eq!(
            classify_device("Botanical Browser", "Windows"),
            (DeviceClass::Desktop, false)
        );
    }

    #[test]
    fn test_unknown() {
        assert_eq!(classify_device("Other", "Other"), (DeviceClass::Other, false));
    }
}
