use ember_model::ModelKind;

/// Shape the user (and optional system) text into the model's expected
/// prompt form.
///
/// Chat models get the Llama-2 instruction wrapping; generate models see the
/// texts concatenated with newlines.
pub fn render(kind: ModelKind, system: Option<&str>, user: &str) -> String {
    match kind {
        ModelKind::Chat => match system {
            Some(system) => {
                format!("[INST] <<SYS>>\n{system}\n<</SYS>>\n\n{user} [/INST]\n")
            }
            None => format!("[INST] {user} [/INST]\n"),
        },
        ModelKind::Generate => match system {
            Some(system) => format!("{system}\n{user}\n"),
            None => user.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_with_system() {
        let p = render(ModelKind::Chat, Some("be brief"), "hello");
        assert_eq!(
            p,
            "[INST] <<SYS>>\nbe brief\n<</SYS>>\n\nhello [/INST]\n"
        );
    }

    #[test]
    fn test_chat_without_system() {
        assert_eq!(render(ModelKind::Chat, None, "hi"), "[INST] hi [/INST]\n");
    }

    #[test]
    fn test_generate_concatenates() {
        assert_eq!(
            render(ModelKind::Generate, Some("context"), "text"),
            "context\ntext\n"
        );
        assert_eq!(render(ModelKind::Generate, None, "text"), "text");
    }
}
