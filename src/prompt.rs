//! URL → prompt construction.

/// Builds the generation prompt for a target URL.
pub trait PromptBuilder: Send + Sync {
    fn build(&self, url: &str) -> String;
}

/// Default prompt: asks for private reasoning in `<thinking>` and the page
/// itself in a single `<code>` block, which is what the extractor expects.
pub struct PagePromptBuilder;

const PAGE_PROMPT: &str = "\
You are a web server for an imaginary internet. Invent the page that would be \
served at the URL below, as if it really existed.

URL: {url}

Rules:
- First, plan the page inside <thinking></thinking> tags: who runs the site, \
what the page is for, and its layout.
- Then output one complete HTML5 document inside <code></code> tags, starting \
with <!DOCTYPE html> and ending with </html>.
- Inline all CSS in a <style> element. Do not use external scripts, fonts or images.
- Links must be absolute URLs to other plausible pages, so the reader can keep browsing.
- Write nothing outside the two tagged sections.";

impl PromptBuilder for PagePromptBuilder {
    fn build(&self, url: &str) -> String {
        PAGE_PROMPT.replace("{url}", url)
    }
}
