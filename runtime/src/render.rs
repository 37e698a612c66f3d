//! Renderer Seam
//!
//! Rendering is an external collaborator: the engine hands a step over
//! and treats the returned markup as an opaque string. `BasicRenderer`
//! exists so flows can be driven end to end without a real template
//! stack; widget markup beyond bare inputs is somebody else's job.

use trellis_core::{ElementKind, Step};

pub trait Renderer: Send + Sync + 'static {
    /// Render the current step (including any outstanding validation
    /// feedback carried on it) to markup.
    fn render(&self, step: &Step, position: &str) -> String;

    /// Transient placeholder served while an offloaded phase runs.
    fn working(&self) -> String {
        "<!doctype html><html><head><meta http-equiv=\"refresh\" content=\"2\">\
         <title>Working</title></head><body><p>One moment, still working&hellip;</p>\
         </body></html>"
            .to_string()
    }

    /// Fixed generic error view for failed sessions.
    fn failure(&self) -> String {
        "<!doctype html><html><head><title>Error</title></head>\
         <body><p>Something went wrong. Please contact the study team.</p></body></html>"
            .to_string()
    }
}

/// Bare-bones HTML form renderer.
#[derive(Debug, Default, Clone)]
pub struct BasicRenderer;

impl Renderer for BasicRenderer {
    fn render(&self, step: &Step, position: &str) -> String {
        let mut out = String::new();
        out.push_str("<!doctype html><html><head><title>");
        out.push_str(&escape(&step.label));
        out.push_str("</title></head><body>");
        out.push_str(&format!(
            "<h1>{}</h1><p class=\"position\">{}</p>",
            escape(&step.label),
            escape(position)
        ));
        if let Some(feedback) = &step.feedback {
            out.push_str(&format!(
                "<p class=\"feedback\">{}</p>",
                escape(&feedback.message)
            ));
        }
        out.push_str("<form method=\"post\">");
        out.push_str(&format!(
            "<input type=\"hidden\" name=\"step\" value=\"{}\">",
            step.id
        ));
        for el in &step.elements {
            let name = el.name.as_deref().unwrap_or_default();
            match &el.kind {
                ElementKind::Static => {
                    if let Some(text) = el.value.as_str() {
                        out.push_str(&format!("<p>{}</p>", escape(text)));
                    }
                }
                ElementKind::TextInput => {
                    out.push_str(&format!(
                        "<label>{name} <input type=\"text\" name=\"{name}\"></label>"
                    ));
                }
                ElementKind::NumberInput { .. } => {
                    out.push_str(&format!(
                        "<label>{name} <input type=\"number\" name=\"{name}\"></label>"
                    ));
                }
                ElementKind::Choice { options } => {
                    out.push_str(&format!("<select name=\"{name}\">"));
                    for option in options {
                        out.push_str(&format!(
                            "<option value=\"{0}\">{0}</option>",
                            escape(option)
                        ));
                    }
                    out.push_str("</select>");
                }
                ElementKind::Timer { .. } => {
                    out.push_str(&format!(
                        "<input type=\"hidden\" name=\"{name}\" value=\"0\">"
                    ));
                }
            }
        }
        out.push_str(
            "<button name=\"direction\" value=\"back\">Back</button>\
             <button name=\"direction\" value=\"forward\">Continue</button>",
        );
        out.push_str("</form></body></html>");
        out
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::{BranchSpec, Element, StepSpec, Tree};

    #[test]
    fn renders_step_token_and_inputs() {
        let tree = Tree::new(
            BranchSpec::new().step(
                StepSpec::new("Q1")
                    .element(Element::display("<hello>"))
                    .element(Element::text("answer")),
            ),
        )
        .unwrap();
        let markup = BasicRenderer.render(tree.current(), "1");
        assert!(markup.contains("name=\"step\""));
        assert!(markup.contains("name=\"answer\""));
        assert!(markup.contains("&lt;hello&gt;"));
    }
}
