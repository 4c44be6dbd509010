//! Response assembly: creative markup and signed tracking URLs.

use crate::state::AppState;
use adserve_core::openrtb::Bid;
use adserve_core::token::{self, TrackingToken};
use adserve_core::types::Creative;
use adserve_engine::AdSelection;
use chrono::Utc;
use uuid::Uuid;

/// Markup for the ad response. Exactly one of the creative's bodies is
/// authoritative: html is passed through, banner assets are composed into
/// an HTML snippet server-side, native ships as a JSON blob.
pub fn render_adm(creative: &Creative) -> String {
    if let Some(html) = &creative.html {
        return html.clone();
    }
    if let Some(assets) = &creative.banner {
        let images: String = assets
            .iter()
            .map(|asset| {
                format!(
                    r#"<img src="{}" width="{}" height="{}" alt="{}" style="display:block;border:0">"#,
                    asset.url, asset.width, asset.height, asset.alt
                )
            })
            .collect();
        return format!(
            r#"<div class="ad-banner" style="width:{}px;height:{}px">{}</div>"#,
            creative.width, creative.height, images
        );
    }
    if let Some(native) = &creative.native {
        return native.to_string();
    }
    String::new()
}

/// Assemble the OpenRTB bid for a selection, embedding one signed token in
/// all three tracking URLs.
pub fn build_bid(
    state: &AppState,
    request_id: &str,
    imp_id: &str,
    user_id: &str,
    selection: &AdSelection,
) -> Bid {
    let payload = TrackingToken {
        r: request_id.to_string(),
        i: imp_id.to_string(),
        c: selection.creative.id,
        cid: selection.creative.campaign_id,
        l: selection.line_item.id,
        u: user_id.to_string(),
        p: selection.creative.publisher_id,
        pl: selection.creative.placement_id.clone(),
        bp: selection.price,
        cur: "USD".to_string(),
        t: Utc::now().timestamp(),
        cp: None,
    };
    let signed = token::generate(&payload, state.token.secret.as_bytes());
    let base = state.public_url.trim_end_matches('/');

    Bid {
        id: Uuid::new_v4().to_string(),
        impid: imp_id.to_string(),
        crid: selection.creative.id.to_string(),
        cid: selection.creative.campaign_id.to_string(),
        adm: render_adm(&selection.creative),
        price: selection.price,
        impurl: format!("{base}/track/impression?t={signed}"),
        clkurl: format!("{base}/track/click?t={signed}"),
        evturl: format!("{base}/track/event?t={signed}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adserve_core::types::BannerAsset;

    fn creative() -> Creative {
        Creative {
            id: 5,
            placement_id: "slot".to_string(),
            line_item_id: 9,
            campaign_id: 3,
            publisher_id: 1,
            html: None,
            native: None,
            banner: None,
            width: 300,
            height: 250,
            format: String::new(),
            click_url: None,
        }
    }

    #[test]
    fn test_html_passthrough() {
        let mut c = creative();
        c.html = Some("<b>hello</b>".to_string());
        assert_eq!(render_adm(&c), "<b>hello</b>");
    }

    #[test]
    fn test_banner_composed_into_html() {
        let mut c = creative();
        c.banner = Some(vec![BannerAsset {
            url: "https://cdn.test/a.png".to_string(),
            width: 300,
            height: 250,
            alt: "ad".to_string(),
        }]);
        let adm = render_adm(&c);
        assert!(adm.contains(r#"<img src="https://cdn.test/a.png""#));
        assert!(adm.starts_with(r#"<div class="ad-banner""#));
    }

    #[test]
    fn test_native_is_json_blob() {
        let mut c = creative();
        c.native = Some(serde_json::json!({"title": "Try it", "cta": "Go"}));
        let adm = render_adm(&c);
        let parsed: serde_json::Value = serde_json::from_str(&adm).expect("valid json");
        assert_eq!(parsed["title"], "Try it");
    }
}
