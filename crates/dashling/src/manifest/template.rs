// Only `%0[width]d` is permitted as a format tag (DASH-IF IOP 4.3), so it is
// implemented directly instead of pulling in a printf implementation.
//
// Example template: "$RepresentationID$/$Number%06d$.m4s"

use regex::{Regex, Replacer};
use std::{collections::HashMap, sync::LazyLock};

static TEMPLATE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(RepresentationID|Number|Time|Bandwidth)(?:%0(\d+)d)?\$").unwrap()
});

/// Values substituted into `initialization` and `media` URL templates.
#[derive(Debug, Default, Clone)]
pub struct UrlTemplate<'a> {
    args: HashMap<&'a str, String>,
}

impl UrlTemplate<'_> {
    pub const REPRESENTATION_ID: &'static str = "RepresentationID";
    pub const NUMBER: &'static str = "Number";
    pub const TIME: &'static str = "Time";
    pub const BANDWIDTH: &'static str = "Bandwidth";

    pub fn new() -> Self {
        Self {
            args: HashMap::with_capacity(4),
        }
    }

    pub fn with(mut self, key: &'static str, value: impl ToString) -> Self {
        self.args.insert(key, value.to_string());
        self
    }

    pub fn resolve(&self, template: &str) -> String {
        TEMPLATE_REGEX
            .replace_all(template, TemplateReplacer(&self.args))
            .to_string()
    }
}

struct TemplateReplacer<'a>(&'a HashMap<&'a str, String>);

impl Replacer for TemplateReplacer<'_> {
    fn replace_append(&mut self, caps: &regex::Captures<'_>, dst: &mut String) {
        let (Some(whole), Some(key)) = (caps.get(0), caps.get(1)) else {
            return;
        };
        let Some(value) = self.0.get(key.as_str()) else {
            dst.push_str(whole.as_str());
            return;
        };

        match caps.get(2).and_then(|m| m.as_str().parse::<usize>().ok()) {
            Some(width) => dst.push_str(&format!("{value:0>width$}")),
            None => dst.push_str(value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_replace() {
        let template = UrlTemplate::new()
            .with(UrlTemplate::REPRESENTATION_ID, "v1")
            .with(UrlTemplate::NUMBER, 2)
            .with(UrlTemplate::TIME, 450450)
            .with(UrlTemplate::BANDWIDTH, 800000);

        assert_eq!(template.resolve("$RepresentationID$/init.mp4"), "v1/init.mp4");
        assert_eq!(
            template.resolve("$RepresentationID$/$Time$.m4s"),
            "v1/450450.m4s"
        );
        assert_eq!(template.resolve("seg-$Number%05d$.m4s"), "seg-00002.m4s");
        assert_eq!(template.resolve("$Bandwidth$_$Number%012d$"), "800000_000000000002");
    }

    #[test]
    fn test_unknown_or_missing_variable() {
        let template = UrlTemplate::new().with(UrlTemplate::NUMBER, 1);
        assert_eq!(template.resolve("$Unknown$"), "$Unknown$");
        assert_eq!(template.resolve("$Time$-$Number$"), "$Time$-1");
    }
}
