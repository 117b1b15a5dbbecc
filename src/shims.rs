//! Compatibility Shim Layer.
//!
//! Patches the synthetic window with standard browser APIs that client
//! libraries probe for but the base environment does not carry. Each shim is
//! an independent, guarded script: it installs its feature only when absent
//! (never overwriting a native implementation) and a missing prerequisite
//! makes that one shim skip rather than fail the installation. Installing
//! twice is a no-op, so the entry point is idempotent.

use deno_core::JsRuntime;

pub struct Shim {
    pub name: &'static str,
    /// Statement body; evaluated inside a try/catch IIFE that must end in
    /// `return "installed"` or `return "skipped"`.
    source: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShimOutcome {
    Installed,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct ShimReport {
    pub name: &'static str,
    pub outcome: ShimOutcome,
}

/// Proxies the browser-only `innerText` accessor to `textContent`, for
/// libraries that only know the variant name.
const INNER_TEXT: Shim = Shim {
    name: "inner-text",
    source: r#"
const proto = (globalThis.HTMLElement || globalThis.Element || {}).prototype;
if (!proto) return "skipped";
if ("innerText" in proto) return "skipped";
Object.defineProperty(proto, "innerText", {
  configurable: true,
  get() { return this.textContent; },
  set(value) { this.textContent = value; },
});
return "installed";
"#,
};

/// Minimal encapsulation root: presence-detection only, no real isolation.
const SHADOW_ROOT: Shim = Shim {
    name: "shadow-root",
    source: r#"
const Elem = globalThis.HTMLElement || globalThis.Element;
if (!Elem || !Elem.prototype) return "skipped";
if (globalThis.ShadowRoot && Elem.prototype.attachShadow) return "skipped";
if (!globalThis.ShadowRoot) {
  globalThis.ShadowRoot = class ShadowRoot {
    constructor(init, host) {
      this.mode = init && init.mode;
      this.host = host;
    }
  };
}
if (!Elem.prototype.attachShadow) {
  Elem.prototype.attachShadow = function (init) {
    const root = new globalThis.ShadowRoot(init || {}, this);
    this.shadowRoot = root;
    return root;
  };
}
return "installed";
"#,
};

/// Constant non-matching media query with no-op listener registration. A
/// presence stub, not a live query engine: nothing ever fires.
const MATCH_MEDIA: Shim = Shim {
    name: "match-media",
    source: r#"
if (typeof globalThis.matchMedia === "function") return "skipped";
globalThis.matchMedia = function (query) {
  return {
    matches: false,
    media: String(query),
    onchange: null,
    addListener() {},
    removeListener() {},
    addEventListener() {},
    removeEventListener() {},
    dispatchEvent() { return false; },
  };
};
return "installed";
"#,
};

/// Selector and traversal backfills: matches/contains/closest/remove/
/// replaceWith, each guarded individually.
const SELECTOR_HELPERS: Shim = Shim {
    name: "selector-helpers",
    source: r#"
const Elem = globalThis.HTMLElement || globalThis.Element;
if (!Elem || !Elem.prototype) return "skipped";
const proto = Elem.prototype;
let touched = false;
if (!proto.matches) {
  proto.matches =
    proto.matchesSelector ||
    proto.msMatchesSelector ||
    proto.mozMatchesSelector ||
    proto.webkitMatchesSelector ||
    function (selector) {
      const matched = (this.ownerDocument || globalThis.document).querySelectorAll(selector);
      let i = matched.length;
      while (--i >= 0 && matched[i] !== this) {}
      return i > -1;
    };
  touched = true;
}
if (!proto.contains) {
  proto.contains = function (node) {
    for (let n = node; n; n = n.parentNode) {
      if (n === this) return true;
    }
    return false;
  };
  touched = true;
}
if (!proto.closest) {
  proto.closest = function (selector) {
    let el = this;
    const doc = this.ownerDocument || globalThis.document;
    if (doc && doc.documentElement && !doc.documentElement.contains(el)) return null;
    do {
      if (el.matches(selector)) return el;
      el = el.parentElement || el.parentNode;
    } while (el !== null && el.nodeType === 1);
    return null;
  };
  touched = true;
}
if (!proto.remove) {
  proto.remove = function () {
    if (this.parentNode) this.parentNode.removeChild(this);
  };
  touched = true;
}
if (!proto.replaceWith) {
  proto.replaceWith = function (...nodes) {
    const parent = this.parentNode;
    if (!parent) return;
    const doc = this.ownerDocument || globalThis.document;
    const fragment = doc.createDocumentFragment();
    for (let i = nodes.length - 1; i >= 0; i--) {
      let node = nodes[i];
      if (typeof node !== "object" || node === null) {
        node = doc.createTextNode(String(node));
      } else if (node.parentNode) {
        node.parentNode.removeChild(node);
      }
      fragment.insertBefore(node, fragment.firstChild);
    }
    parent.replaceChild(fragment, this);
  };
  touched = true;
}
return touched ? "installed" : "skipped";
"#,
};

/// Aliases `HTMLElement` to the generic element type when no distinct root
/// type exists. Guards elsewhere resolve `HTMLElement || Element`, so this
/// is not order-sensitive.
const ELEMENT_BASE: Shim = Shim {
    name: "element-base",
    source: r#"
if (globalThis.HTMLElement) return "skipped";
if (!globalThis.Element) return "skipped";
globalThis.HTMLElement = globalThis.Element;
return "installed";
"#,
};

/// No-op scroll plus observer stubs; enough to survive construction, never
/// enough to report real geometry.
const OBSERVERS_AND_SCROLL: Shim = Shim {
    name: "observers-and-scroll",
    source: r#"
let touched = false;
if (typeof globalThis.scrollTo !== "function") {
  globalThis.scrollTo = function () {};
  touched = true;
}
class StubObserver {
  constructor(callback) { this._callback = callback; }
  observe() {}
  unobserve() {}
  disconnect() {}
  takeRecords() { return []; }
}
if (!globalThis.ResizeObserver) {
  globalThis.ResizeObserver = StubObserver;
  touched = true;
}
if (!globalThis.IntersectionObserver) {
  globalThis.IntersectionObserver = StubObserver;
  touched = true;
}
return touched ? "installed" : "skipped";
"#,
};

/// Backfills the modern CustomEvent constructor through the legacy
/// create-and-init path, then aliases its prototype to Event's so
/// instanceof checks succeed.
const CUSTOM_EVENT: Shim = Shim {
    name: "custom-event",
    source: r#"
if (typeof globalThis.CustomEvent === "function") return "skipped";
const doc = globalThis.document;
if (!doc || typeof doc.createEvent !== "function") return "skipped";
if (!globalThis.Event) return "skipped";
function CustomEvent(type, params) {
  params = params || { bubbles: false, cancelable: false, detail: null };
  const event = doc.createEvent("CustomEvent");
  event.initCustomEvent(type, params.bubbles, params.cancelable, params.detail);
  return event;
}
CustomEvent.prototype = globalThis.Event.prototype;
globalThis.CustomEvent = CustomEvent;
return "installed";
"#,
};

pub const SHIMS: &[Shim] = &[
    INNER_TEXT,
    SHADOW_ROOT,
    MATCH_MEDIA,
    SELECTOR_HELPERS,
    ELEMENT_BASE,
    OBSERVERS_AND_SCROLL,
    CUSTOM_EVENT,
];

/// Install every shim into the runtime's window. Never fails: a shim whose
/// prerequisites are missing (or whose script errors) is reported as skipped
/// and the rest still install.
pub fn install_polyfills(runtime: &mut JsRuntime) -> Vec<ShimReport> {
    SHIMS
        .iter()
        .map(|shim| {
            let code = format!(
                "(() => {{ try {{\n{}\n}} catch (e) {{ return \"skipped\"; }} }})()",
                shim.source
            );
            let outcome = match eval_to_string(runtime, shim.name, code) {
                Ok(result) if result == "installed" => ShimOutcome::Installed,
                Ok(_) => ShimOutcome::Skipped,
                Err(err) => {
                    tracing::debug!(shim = shim.name, %err, "shim script failed to evaluate");
                    ShimOutcome::Skipped
                }
            };
            if outcome == ShimOutcome::Skipped {
                tracing::debug!(shim = shim.name, "shim skipped");
            }
            ShimReport {
                name: shim.name,
                outcome,
            }
        })
        .collect()
}

fn eval_to_string(
    runtime: &mut JsRuntime,
    name: &'static str,
    code: String,
) -> Result<String, anyhow::Error> {
    let global = runtime.execute_script(name, code)?;
    let scope = &mut runtime.handle_scope();
    let local = deno_core::v8::Local::new(scope, global);
    Ok(local.to_rust_string_lossy(scope))
}

#[cfg(test)]
mod tests {
    use super::*;
    use deno_core::{JsRuntime, RuntimeOptions};

    // A bare isolate with a hand-rolled element prototype stands in for the
    // synthetic window; full-environment behavior is covered by the
    // integration tests.
    fn bare_runtime_with_dom_roots() -> JsRuntime {
        let mut runtime = JsRuntime::new(RuntimeOptions::default());
        runtime
            .execute_script(
                "<setup>",
                r#"
                globalThis.Element = class Element {};
                globalThis.Event = class Event {};
                globalThis.document = {
                  createEvent() {
                    const e = new globalThis.Event();
                    e.initCustomEvent = function (type, bubbles, cancelable, detail) {
                      this.type = type;
                      this.detail = detail;
                    };
                    return e;
                  },
                  createDocumentFragment() { return {}; },
                };
                "#,
            )
            .unwrap();
        runtime
    }

    fn outcome_of<'a>(reports: &'a [ShimReport], name: &str) -> &'a ShimOutcome {
        &reports.iter().find(|r| r.name == name).unwrap().outcome
    }

    #[test]
    fn test_installs_missing_features() {
        let mut runtime = bare_runtime_with_dom_roots();
        let reports = install_polyfills(&mut runtime);

        assert_eq!(*outcome_of(&reports, "inner-text"), ShimOutcome::Installed);
        assert_eq!(*outcome_of(&reports, "match-media"), ShimOutcome::Installed);
        assert_eq!(*outcome_of(&reports, "element-base"), ShimOutcome::Installed);
        assert_eq!(*outcome_of(&reports, "custom-event"), ShimOutcome::Installed);

        let check = eval_to_string(
            &mut runtime,
            "<check>",
            r#"[
                typeof globalThis.matchMedia,
                typeof globalThis.CustomEvent,
                typeof globalThis.ResizeObserver,
                typeof globalThis.scrollTo,
                globalThis.HTMLElement === globalThis.Element,
            ].join(",")"#
                .to_string(),
        )
        .unwrap();
        assert_eq!(check, "function,function,function,function,true");
    }

    #[test]
    fn test_never_overwrites_native_implementations() {
        let mut runtime = bare_runtime_with_dom_roots();
        runtime
            .execute_script(
                "<native>",
                r#"
                globalThis.matchMedia = function native() { return { matches: true }; };
                globalThis.Element.prototype.matches = function () { return "native"; };
                "#,
            )
            .unwrap();

        let reports = install_polyfills(&mut runtime);
        assert_eq!(*outcome_of(&reports, "match-media"), ShimOutcome::Skipped);

        let kept = eval_to_string(
            &mut runtime,
            "<check>",
            "String(globalThis.matchMedia('x').matches)".to_string(),
        )
        .unwrap();
        assert_eq!(kept, "true");
    }

    #[test]
    fn test_missing_prerequisites_skip_without_failing_the_rest() {
        // No Element, no document at all: prototype-based shims skip but the
        // window-level ones still install.
        let mut runtime = JsRuntime::new(RuntimeOptions::default());
        let reports = install_polyfills(&mut runtime);

        assert_eq!(*outcome_of(&reports, "inner-text"), ShimOutcome::Skipped);
        assert_eq!(*outcome_of(&reports, "shadow-root"), ShimOutcome::Skipped);
        assert_eq!(*outcome_of(&reports, "custom-event"), ShimOutcome::Skipped);
        assert_eq!(*outcome_of(&reports, "match-media"), ShimOutcome::Installed);
        assert_eq!(
            *outcome_of(&reports, "observers-and-scroll"),
            ShimOutcome::Installed
        );
    }

    #[test]
    fn test_idempotent() {
        let mut runtime = bare_runtime_with_dom_roots();
        let first = install_polyfills(&mut runtime);
        assert!(first.iter().any(|r| r.outcome == ShimOutcome::Installed));

        let second = install_polyfills(&mut runtime);
        assert!(second.iter().all(|r| r.outcome == ShimOutcome::Skipped));
    }

    #[test]
    fn test_replace_with_builds_fragment_in_reverse_order() {
        let mut runtime = bare_runtime_with_dom_roots();
        install_polyfills(&mut runtime);

        // Drive replaceWith with a tiny recording parent/fragment pair.
        let order = eval_to_string(
            &mut runtime,
            "<replace-with>",
            r#"
            (() => {
              const inserted = [];
              const fragment = {
                firstChild: null,
                insertBefore(node, ref) {
                  inserted.unshift(node.name);
                  this.firstChild = node;
                },
              };
              globalThis.document.createDocumentFragment = () => fragment;
              const parent = {
                replaced: null,
                removeChild() {},
                replaceChild(frag, old) { this.replaced = frag; },
              };
              const target = new globalThis.Element();
              target.parentNode = parent;
              target.ownerDocument = globalThis.document;
              const a = { name: "a", parentNode: null };
              const b = { name: "b", parentNode: null };
              target.replaceWith(a, b);
              return inserted.join(",") + "|" + String(parent.replaced === fragment);
            })()
            "#
            .to_string(),
        )
        .unwrap();
        // Reverse-order insertion at firstChild preserves document order.
        assert_eq!(order, "a,b|true");
    }
}
