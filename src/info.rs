/// Service description returned for `describe`

use crate::detector::{Language, WakeEngine};
use crate::protocol::{Attribution, Info, WakeModel, WakeProgram};

pub const PROGRAM_NAME: &str = "wyoming-wakeword";

fn attribution() -> Attribution {
    Attribution {
        name: "AetherOS".to_string(),
        url: env!("CARGO_PKG_REPOSITORY").to_string(),
    }
}

/// Describe the wake program and the keywords available for `language`
pub fn service_info(engine: &dyn WakeEngine, language: Language) -> Info {
    let version = env!("CARGO_PKG_VERSION").to_string();

    let models = engine
        .catalog()
        .into_iter()
        .filter(|entry| entry.language == language)
        .map(|entry| WakeModel {
            description: Some(format!("{} ({})", entry.name, entry.language)),
            phrase: Some(entry.name.clone()),
            name: entry.name,
            attribution: attribution(),
            installed: true,
            languages: vec![entry.language.code().to_string()],
            version: Some(version.clone()),
        })
        .collect();

    Info {
        wake: vec![WakeProgram {
            name: PROGRAM_NAME.to_string(),
            description: Some(env!("CARGO_PKG_DESCRIPTION").to_string()),
            attribution: attribution(),
            installed: true,
            version: Some(version),
            models,
        }],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ToneEngine;

    #[test]
    fn test_lists_models_for_language() {
        let engine = ToneEngine::new("test_key").with_keyword(Language::Fr, "bonjour");
        let info = service_info(&engine, Language::Fr);

        assert_eq!(info.wake.len(), 1);
        let names: Vec<&str> = info.wake[0].models.iter().map(|m| m.name.as_str()).collect();
        assert!(names.contains(&"framboise"));
        assert!(names.contains(&"bonjour"));
        assert!(!names.contains(&"porcupine"));
        assert!(info.wake[0].models.iter().all(|m| m.languages == vec!["fr"]));
    }

    #[test]
    fn test_attribution_links_project() {
        let info = service_info(&ToneEngine::new("test_key"), Language::En);

        let program = &info.wake[0];
        assert!(program.attribution.url.starts_with("https://"));
        assert!(program.models.iter().all(|m| m.attribution == program.attribution));
    }
}
