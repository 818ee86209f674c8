//! Per-gateway topic templates
//!
//! Topics are configured as templates such as `gateway/{{ .MAC }}/rx`. The
//! only variable is the gateway EUI, substituted in its canonical lowercase
//! hex form. Templates are compiled once at startup so configuration mistakes
//! surface before the broker connection is made, and rendered for every
//! publish and subscribe because gateway identifiers are only learned at
//! runtime.

use crate::protocol::Eui64;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;
use thiserror::Error;

/// MQTT limits topic names to a u16 length prefix
pub const MAX_TOPIC_LEN: usize = u16::MAX as usize;

static ACTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{(.*?)\}\}").unwrap());

/// Role a topic plays for a gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicRole {
    Uplink,
    Downlink,
    Stats,
    Ack,
}

impl fmt::Display for TopicRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TopicRole::Uplink => "uplink",
            TopicRole::Downlink => "downlink",
            TopicRole::Stats => "stats",
            TopicRole::Ack => "ack",
        };
        f.write_str(name)
    }
}

/// Topic template errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TemplateError {
    #[error("topic template is empty")]
    Empty,
    #[error("unterminated action in topic template '{0}'")]
    Unterminated(String),
    #[error("topic template references undefined field '{0}', only .MAC is available")]
    UndefinedField(String),
    #[error("topic template must contain exactly one {{{{ .MAC }}}} substitution, found {0}")]
    SubstitutionCount(usize),
    #[error("topic template contains MQTT wildcard '{0}'")]
    Wildcard(char),
    #[error("rendered topic is {0} bytes, exceeding the MQTT limit of {MAX_TOPIC_LEN}")]
    TooLong(usize),
    #[error("{role} topic template: {source}")]
    Role {
        role: TopicRole,
        #[source]
        source: Box<TemplateError>,
    },
}

impl TemplateError {
    fn for_role(self, role: TopicRole) -> Self {
        TemplateError::Role {
            role,
            source: Box::new(self),
        }
    }
}

/// A compiled topic template with exactly one gateway substitution
#[derive(Debug, Clone, PartialEq)]
pub struct TopicTemplate {
    source: String,
    prefix: String,
    suffix: String,
}

impl TopicTemplate {
    pub fn parse(template: &str) -> Result<Self, TemplateError> {
        if template.trim().is_empty() {
            return Err(TemplateError::Empty);
        }

        let mut literals = Vec::new();
        let mut last = 0;
        let mut substitutions = 0;
        for capture in ACTION.captures_iter(template) {
            let (Some(whole), Some(inner)) = (capture.get(0), capture.get(1)) else {
                continue;
            };
            let field = inner.as_str().trim();
            if field != ".MAC" {
                return Err(TemplateError::UndefinedField(field.to_string()));
            }
            literals.push(&template[last..whole.start()]);
            last = whole.end();
            substitutions += 1;
        }
        literals.push(&template[last..]);

        if literals.iter().any(|literal| literal.contains("{{")) {
            return Err(TemplateError::Unterminated(template.to_string()));
        }
        if substitutions != 1 {
            return Err(TemplateError::SubstitutionCount(substitutions));
        }
        if let Some(wildcard) = template.chars().find(|c| *c == '+' || *c == '#') {
            return Err(TemplateError::Wildcard(wildcard));
        }

        Ok(Self {
            source: template.to_string(),
            prefix: literals[0].to_string(),
            suffix: literals[1].to_string(),
        })
    }

    pub fn render(&self, gateway: &Eui64) -> Result<String, TemplateError> {
        let topic = format!("{}{}{}", self.prefix, gateway, self.suffix);
        if topic.len() > MAX_TOPIC_LEN {
            return Err(TemplateError::TooLong(topic.len()));
        }
        Ok(topic)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

/// The four topic templates of a backend
#[derive(Debug, Clone, PartialEq)]
pub struct Topics {
    uplink: TopicTemplate,
    downlink: TopicTemplate,
    stats: TopicTemplate,
    ack: TopicTemplate,
}

impl Topics {
    /// Compile and trial-render all four templates
    pub fn parse(
        uplink: &str,
        downlink: &str,
        stats: &str,
        ack: &str,
    ) -> Result<Self, TemplateError> {
        let compile = |role: TopicRole, template: &str| {
            let compiled = TopicTemplate::parse(template).map_err(|e| e.for_role(role))?;
            compiled
                .render(&Eui64::default())
                .map_err(|e| e.for_role(role))?;
            Ok::<_, TemplateError>(compiled)
        };

        Ok(Self {
            uplink: compile(TopicRole::Uplink, uplink)?,
            downlink: compile(TopicRole::Downlink, downlink)?,
            stats: compile(TopicRole::Stats, stats)?,
            ack: compile(TopicRole::Ack, ack)?,
        })
    }

    pub fn template(&self, role: TopicRole) -> &TopicTemplate {
        match role {
            TopicRole::Uplink => &self.uplink,
            TopicRole::Downlink => &self.downlink,
            TopicRole::Stats => &self.stats,
            TopicRole::Ack => &self.ack,
        }
    }

    pub fn render(&self, role: TopicRole, gateway: &Eui64) -> Result<String, TemplateError> {
        self.template(role)
            .render(gateway)
            .map_err(|e| e.for_role(role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn default_topics() -> Topics {
        Topics::parse(
            "gateway/{{ .MAC }}/rx",
            "gateway/{{ .MAC }}/tx",
            "gateway/{{ .MAC }}/stats",
            "gateway/{{ .MAC }}/ack",
        )
        .unwrap()
    }

    #[test]
    fn test_render_each_role() {
        let topics = default_topics();
        let gateway: Eui64 = "01:02:03:04:05:06:07:08".parse().unwrap();

        assert_eq!(
            topics.render(TopicRole::Uplink, &gateway).unwrap(),
            "gateway/0102030405060708/rx"
        );
        assert_eq!(
            topics.render(TopicRole::Downlink, &gateway).unwrap(),
            "gateway/0102030405060708/tx"
        );
        assert_eq!(
            topics.render(TopicRole::Stats, &gateway).unwrap(),
            "gateway/0102030405060708/stats"
        );
        assert_eq!(
            topics.render(TopicRole::Ack, &gateway).unwrap(),
            "gateway/0102030405060708/ack"
        );
    }

    #[test]
    fn test_whitespace_inside_action_is_optional() {
        let compact = TopicTemplate::parse("gateway/{{.MAC}}/tx").unwrap();
        let spaced = TopicTemplate::parse("gateway/{{   .MAC  }}/tx").unwrap();
        let gateway = Eui64::from(0xaabbccddeeff0011u64);

        assert_eq!(compact.render(&gateway).unwrap(), "gateway/aabbccddeeff0011/tx");
        assert_eq!(compact.render(&gateway), spaced.render(&gateway));
    }

    #[test]
    fn test_substitution_at_edges() {
        let gateway = Eui64::from(1u64);
        let leading = TopicTemplate::parse("{{ .MAC }}/up").unwrap();
        let bare = TopicTemplate::parse("{{ .MAC }}").unwrap();

        assert_eq!(leading.render(&gateway).unwrap(), "0000000000000001/up");
        assert_eq!(bare.render(&gateway).unwrap(), "0000000000000001");
    }

    #[test]
    fn test_invalid_templates() {
        assert_eq!(TopicTemplate::parse(""), Err(TemplateError::Empty));
        assert_eq!(TopicTemplate::parse("   "), Err(TemplateError::Empty));
        assert_eq!(
            TopicTemplate::parse("gateway/tx"),
            Err(TemplateError::SubstitutionCount(0))
        );
        assert_eq!(
            TopicTemplate::parse("{{ .MAC }}/{{ .MAC }}"),
            Err(TemplateError::SubstitutionCount(2))
        );
        assert_eq!(
            TopicTemplate::parse("gateway/{{ .EUI }}/tx"),
            Err(TemplateError::UndefinedField(".EUI".to_string()))
        );
        assert!(matches!(
            TopicTemplate::parse("gateway/{{ .MAC /tx"),
            Err(TemplateError::Unterminated(_))
        ));
        assert_eq!(
            TopicTemplate::parse("gateway/{{ .MAC }}/#"),
            Err(TemplateError::Wildcard('#'))
        );
        assert_eq!(
            TopicTemplate::parse("+/{{ .MAC }}/tx"),
            Err(TemplateError::Wildcard('+'))
        );
    }

    #[test]
    fn test_topics_error_names_role() {
        let err = Topics::parse(
            "gateway/{{ .MAC }}/rx",
            "gateway/{{ .MAC }}/tx",
            "",
            "gateway/{{ .MAC }}/ack",
        )
        .unwrap_err();

        match &err {
            TemplateError::Role { role, source } => {
                assert_eq!(*role, TopicRole::Stats);
                assert_eq!(**source, TemplateError::Empty);
            }
            other => panic!("Expected role error, got {other:?}"),
        }
        assert_eq!(err.to_string(), "stats topic template: topic template is empty");
    }

    #[test]
    fn test_oversized_template_fails_at_parse_time() {
        let huge = format!("{}/{{{{ .MAC }}}}", "a".repeat(MAX_TOPIC_LEN));
        let err = Topics::parse(&huge, "{{ .MAC }}", "{{ .MAC }}", "{{ .MAC }}").unwrap_err();
        assert!(matches!(
            err,
            TemplateError::Role { role: TopicRole::Uplink, ref source }
                if matches!(**source, TemplateError::TooLong(_))
        ));
    }

    proptest! {
        #[test]
        fn render_is_deterministic(bytes in any::<[u8; 8]>(), prefix in "[a-z/]{0,20}") {
            let template = TopicTemplate::parse(&format!("{prefix}{{{{ .MAC }}}}/tx")).unwrap();
            let gateway = Eui64::new(bytes);
            let first = template.render(&gateway).unwrap();
            let second = template.render(&gateway).unwrap();
            prop_assert_eq!(&first, &second);
            prop_assert!(first.contains(&gateway.to_string()));
        }
    }
}
