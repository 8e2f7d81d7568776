//! Localized notification templates with strict `{{placeholder}}` substitution.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::TemplateError;
use crate::models::Language;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateText {
    #[serde(default)]
    pub subject: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedMessage {
    pub template_id: String,
    pub requested_language: Language,
    pub language: Language,
    pub subject: Option<String>,
    pub body: String,
    /// Set when the requested language had no entry and another one was used.
    pub fell_back: bool,
}

pub struct TemplateEngine {
    catalog: HashMap<String, HashMap<Language, TemplateText>>,
    default_language: Language,
}

impl TemplateEngine {
    pub fn new(
        catalog: HashMap<String, HashMap<Language, TemplateText>>,
        default_language: Language,
    ) -> Self {
        Self {
            catalog,
            default_language,
        }
    }

    pub fn builtin(default_language: Language) -> Self {
        Self::new(builtin_catalog(), default_language)
    }

    /// Load a catalog shaped as `{ "template_id": { "en": { "subject": .., "body": .. } } }`.
    pub fn from_json_file(path: &Path, default_language: Language) -> Result<Self, TemplateError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| TemplateError::Catalog(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&raw, default_language)
    }

    pub fn from_json_str(raw: &str, default_language: Language) -> Result<Self, TemplateError> {
        let catalog: HashMap<String, HashMap<Language, TemplateText>> =
            serde_json::from_str(raw).map_err(|e| TemplateError::Catalog(e.to_string()))?;
        Ok(Self::new(catalog, default_language))
    }

    pub fn default_language(&self) -> Language {
        self.default_language
    }

    pub fn contains(&self, template_id: &str) -> bool {
        self.catalog
            .get(template_id)
            .is_some_and(|variants| !variants.is_empty())
    }

    pub fn render(
        &self,
        template_id: &str,
        language: Language,
        variables: &HashMap<String, String>,
    ) -> Result<RenderedMessage, TemplateError> {
        let (used, text) = self.resolve(template_id, language)?;
        let fell_back = used != language;
        if fell_back {
            warn!(
                template_id,
                requested = %language,
                used = %used,
                "Template language unavailable, falling back"
            );
        }

        let body = substitute(&text.body, variables).map_err(|placeholder| {
            TemplateError::Render {
                template_id: template_id.to_string(),
                language: used,
                placeholder,
            }
        })?;
        let subject = text
            .subject
            .as_deref()
            .map(|s| substitute(s, variables))
            .transpose()
            .map_err(|placeholder| TemplateError::Render {
                template_id: template_id.to_string(),
                language: used,
                placeholder,
            })?;

        Ok(RenderedMessage {
            template_id: template_id.to_string(),
            requested_language: language,
            language: used,
            subject,
            body,
            fell_back,
        })
    }

    /// Requested language, then the default language, then any language in code order.
    fn resolve(
        &self,
        template_id: &str,
        language: Language,
    ) -> Result<(Language, &TemplateText), TemplateError> {
        let not_found = || TemplateError::NotFound {
            template_id: template_id.to_string(),
        };
        let variants = self.catalog.get(template_id).ok_or_else(not_found)?;

        if let Some(text) = variants.get(&language) {
            return Ok((language, text));
        }
        if let Some(text) = variants.get(&self.default_language) {
            return Ok((self.default_language, text));
        }
        variants
            .iter()
            .min_by_key(|(lang, _)| lang.code())
            .map(|(lang, text)| (*lang, text))
            .ok_or_else(not_found)
    }
}

/// Replace every `{{name}}`. Returns the first unresolved placeholder as the error.
fn substitute(template: &str, variables: &HashMap<String, String>) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(rest[start..].to_string());
        };
        let name = after[..end].trim();
        match variables.get(name) {
            Some(value) if !name.is_empty() => out.push_str(value),
            _ => return Err(format!("{{{{{name}}}}}")),
        }
        rest = &after[end + 2..];
    }

    out.push_str(rest);
    Ok(out)
}

fn builtin_catalog() -> HashMap<String, HashMap<Language, TemplateText>> {
    let entry = |subject: &str, body: &str| TemplateText {
        subject: Some(subject.to_string()),
        body: body.to_string(),
    };

    let mut catalog = HashMap::new();
    catalog.insert(
        "risk_alert".to_string(),
        HashMap::from([
            (
                Language::English,
                entry(
                    "{{student_name}}: {{domain}} risk",
                    "Dear {{guardian_name}}, {{student_name}} has been flagged for {{domain}} risk ({{severity}}): {{reasons}}. Please contact the school.",
                ),
            ),
            (
                Language::French,
                entry(
                    "{{student_name}} : risque {{domain}}",
                    "Cher/Chère {{guardian_name}}, {{student_name}} a été signalé(e) pour un risque {{domain}} ({{severity}}) : {{reasons}}. Veuillez contacter l'école.",
                ),
            ),
            (
                Language::Kinyarwanda,
                entry(
                    "{{student_name}}: ibyago bya {{domain}}",
                    "Mubyeyi {{guardian_name}}, {{student_name}} yagaragaweho ibyago bya {{domain}} ({{severity}}): {{reasons}}. Mwavugana n'ishuri.",
                ),
            ),
        ]),
    );
    catalog.insert(
        "attendance_reminder".to_string(),
        HashMap::from([
            (
                Language::English,
                entry(
                    "Attendance reminder",
                    "Dear {{guardian_name}}, {{student_name}} has missed school recently. Regular attendance matters.",
                ),
            ),
            (
                Language::French,
                entry(
                    "Rappel d'assiduité",
                    "Cher/Chère {{guardian_name}}, {{student_name}} a manqué l'école récemment. L'assiduité est importante.",
                ),
            ),
        ]),
    );
    catalog.insert(
        "meeting_invitation".to_string(),
        HashMap::from([(
            Language::English,
            entry(
                "Meeting about {{student_name}}",
                "Dear {{guardian_name}}, please visit the school to discuss {{student_name}}'s progress.",
            ),
        )]),
    );
    catalog
}
