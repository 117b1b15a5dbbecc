//! Hydration rewrite of the serialized document.
//!
//! The pipeline's injected bootstrap already executed server-side; shipping
//! it verbatim would make the browser run the application twice against a
//! DOM it did not build. This pass removes the bootstrap markup and turns
//! the first application-created `script[src]` into a deferred loader: once
//! the real browser's document has loaded, the loader clears the
//! server-rendered body and appends a fresh module script pointing at the
//! same URL, so the client re-executes the application exactly as it would
//! in a client-only load. The pre-swap markup stays visible to crawlers and
//! for first paint.
//!
//! The rewrite is structural (HTML parser driven, keyed on the bootstrap's
//! marker attribute), not a text match against the serialized output, so a
//! page that happens to contain identical script text elsewhere is safe.

use std::cell::RefCell;
use std::rc::Rc;

use lol_html::{element, html_content::ContentType, rewrite_str, RewriteStrSettings};

use crate::document::BOOTSTRAP_MARKER;

pub struct HydratedPage {
    pub html: String,
    /// Source URL the deferred loader points at, when a rewrite happened.
    pub loader_src: Option<String>,
}

/// Deferred client-side loader markup for an application bundle at `src`.
fn deferred_loader(src: &str) -> String {
    // JSON string syntax is valid JS; escaping "<" keeps a "</script>" in
    // the URL from terminating the inline script early.
    let src_literal = serde_json::to_string(src)
        .unwrap_or_else(|_| String::from("\"\""))
        .replace('<', "\\u003c");
    format!(
        "<script>window.addEventListener(\"load\",function(){{\
         document.body.innerHTML=\"\";\
         var s=document.createElement(\"script\");\
         s.type=\"module\";\
         s.src={src_literal};\
         document.body.appendChild(s);\
         }});</script>"
    )
}

/// Remove the injected bootstrap and swap the first application script that
/// has a resolvable source URL for the deferred loader. If the application
/// created no such script, only the bootstrap removal happens.
pub fn rewrite_for_hydration(html: &str) -> Result<HydratedPage, lol_html::errors::RewritingError> {
    let loader_src: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));

    let bootstrap_selector = format!("script[{BOOTSTRAP_MARKER}]");
    let rewritten = rewrite_str(
        html,
        RewriteStrSettings {
            element_content_handlers: vec![
                element!(bootstrap_selector, |el| {
                    el.remove();
                    Ok(())
                }),
                element!("script[src]", {
                    let loader_src = Rc::clone(&loader_src);
                    move |el| {
                        if el.has_attribute(BOOTSTRAP_MARKER) {
                            return Ok(());
                        }
                        if loader_src.borrow().is_some() {
                            return Ok(());
                        }
                        let Some(src) = el.get_attribute("src") else {
                            return Ok(());
                        };
                        el.replace(&deferred_loader(&src), ContentType::Html);
                        *loader_src.borrow_mut() = Some(src);
                        Ok(())
                    }
                }),
            ],
            ..RewriteStrSettings::default()
        },
    )?;

    let loader_src = loader_src.borrow().clone();
    Ok(HydratedPage {
        html: rewritten,
        loader_src,
    })
}
