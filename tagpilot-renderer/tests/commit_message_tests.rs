use tagpilot_core::types::{AppName, ImageChange};
use tagpilot_renderer::{CommitContext, CommitMessageRenderer, RenderError};

fn change(image: &str, old: &str, new: &str) -> ImageChange {
    ImageChange {
        alias: image.rsplit('/').next().unwrap_or(image).to_string(),
        image: image.to_string(),
        old_tag: Some(old.to_string()),
        new_tag: new.to_string(),
        helm: None,
        kustomize_name: None,
    }
}

#[test]
fn default_template_single_app() {
    let renderer = CommitMessageRenderer::new(None).expect("renderer");
    let mut ctx = CommitContext::new("https://example.com/deploy.git", "main");
    ctx.push_app(
        &AppName::from("checkout"),
        &[
            change("ghcr.io/shop/checkout", "1.4.0", "1.5.0"),
            change("nginx", "1.25", "1.27"),
        ],
    );

    let msg = renderer.render(&ctx).expect("render");
    assert!(msg.starts_with("build: automatic update of checkout\n"), "got: {msg}");
    assert!(msg.contains("updates image ghcr.io/shop/checkout tag '1.4.0' to '1.5.0'"));
    assert!(msg.contains("updates image nginx tag '1.25' to '1.27'"));
    assert!(msg.ends_with('\n') && !msg.ends_with("\n\n"));
}

#[test]
fn default_template_lists_every_app_of_a_batch() {
    let renderer = CommitMessageRenderer::new(None).expect("renderer");
    let mut ctx = CommitContext::new("https://example.com/deploy.git", "main");
    ctx.push_app(&AppName::from("a"), &[change("img-a", "1", "2")]);
    ctx.push_app(&AppName::from("b"), &[change("img-b", "3", "4")]);

    let msg = renderer.render(&ctx).expect("render");
    assert!(msg.starts_with("build: automatic update of 2 applications"), "got: {msg}");
    assert!(msg.contains("a:\nupdates image img-a tag '1' to '2'"), "got: {msg}");
    assert!(msg.contains("b:\nupdates image img-b tag '3' to '4'"), "got: {msg}");
}

#[test]
fn custom_template_overrides_default() {
    let renderer = CommitMessageRenderer::new(Some(
        "chore({{ branch }}): {{ change_count }} image(s){% for app in apps %} {{ app.app_name }}{% endfor %}",
    ))
    .expect("renderer");
    let mut ctx = CommitContext::new("https://example.com/deploy.git", "release");
    ctx.push_app(&AppName::from("web"), &[change("web", "1", "2")]);

    assert_eq!(renderer.render(&ctx).expect("render"), "chore(release): 1 image(s) web\n");
}

#[test]
fn broken_custom_template_fails_at_construction() {
    let err = CommitMessageRenderer::new(Some("{% for x in %}")).unwrap_err();
    assert!(matches!(err, RenderError::Tera(_)), "got: {err}");
}
