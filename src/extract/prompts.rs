//! Prompt rendering for extraction passes.
//!
//! Prompts are plain text with uppercase tag blocks delimiting the episode
//! content, prior context, and the entity type registry. Both backends
//! consume the same rendered messages; the remote backend additionally
//! appends a JSON schema instruction before dispatch.

use crate::backend::Message;
use crate::graph::{Episode, EpisodeSource, ENTITY_TYPES};

use super::truncate_chars;

/// How many of the most recent prior episodes are included as context.
pub const PREVIOUS_EPISODE_WINDOW: usize = 3;
/// How many characters of each prior episode's content are kept.
pub const PREVIOUS_CONTENT_CHARS: usize = 100;

pub(crate) const EXTRACTED_OPEN: &str = "<EXTRACTED ENTITIES>";
pub(crate) const EXTRACTED_CLOSE: &str = "</EXTRACTED ENTITIES>";

/// Render the entity extraction prompt for one episode. `missed` carries
/// entity names a reflexion pass flagged, folded in as an extra instruction
/// so the next pass does not drop them again.
pub fn extraction_messages(
    episode: &Episode,
    previous: &[Episode],
    missed: &[String],
) -> Vec<Message> {
    let custom = missed_instruction(missed);
    match episode.source {
        EpisodeSource::Message => {
            let system = "You are an assistant that extracts entity nodes from \
                          conversational messages. Extract all entities, concepts, and \
                          actors that are explicitly or implicitly mentioned in the \
                          current message. Pick the closest matching entity type for \
                          each one and keep summaries short.";
            let user = format!(
                "<PREVIOUS MESSAGES>\n{}</PREVIOUS MESSAGES>\n\n\
                 <CURRENT MESSAGE>\n{}\n</CURRENT MESSAGE>\n\n\
                 <ENTITY TYPES>\n{}</ENTITY TYPES>\n{}\n\
                 Extract entities mentioned in the current message. Entities from \
                 earlier messages matter only when the current message refers to them.",
                previous_window(previous),
                episode.content,
                entity_types_block(),
                custom,
            );
            vec![Message::system(system), Message::user(user)]
        }
        EpisodeSource::Json => {
            let system = "You are an assistant that extracts entity nodes from \
                          structured JSON data. Extract all significant entities from \
                          field names and values, including identifiers and names. \
                          Pick the closest matching entity type for each one and keep \
                          summaries short.";
            let user = format!(
                "<JSON>\n{}\n</JSON>\n\n\
                 <ENTITY TYPES>\n{}</ENTITY TYPES>\n{}\n\
                 Extract all significant entities from the structured data.",
                episode.content,
                entity_types_block(),
                custom,
            );
            vec![Message::system(system), Message::user(user)]
        }
        EpisodeSource::Text | EpisodeSource::Conversation => {
            let system = "You are an assistant that extracts entity nodes from text \
                          documents. Extract all significant entities, concepts, and \
                          actors mentioned in the provided text. Pick the closest \
                          matching entity type for each one and keep summaries short.";
            let user = format!(
                "<TEXT>\n{}\n</TEXT>\n\n\
                 <ENTITY TYPES>\n{}</ENTITY TYPES>\n{}\n\
                 Extract all significant entities from the text.",
                episode.content,
                entity_types_block(),
                custom,
            );
            vec![Message::system(system), Message::user(user)]
        }
    }
}

/// Render the reflexion prompt: given the names extracted so far, ask which
/// clearly mentioned entities are still missing.
pub fn reflexion_messages(
    episode: &Episode,
    previous: &[Episode],
    extracted: &[String],
) -> Vec<Message> {
    let system = "You are an assistant that checks entity extractions for \
                  completeness. Compare the episode content against the entities \
                  extracted so far and report names that are clearly mentioned but \
                  missing from the list. Report nothing when the extraction already \
                  covers the content.";
    let user = format!(
        "<EPISODE CONTENT>\n{}\n</EPISODE CONTENT>\n\n\
         {}\n{}\n{}\n\n\
         <PREVIOUS EPISODES>\n{}</PREVIOUS EPISODES>\n\n\
         Review the episode content and list entities that the extraction missed.",
        episode.content,
        EXTRACTED_OPEN,
        extracted.join("\n"),
        EXTRACTED_CLOSE,
        previous_window(previous),
    );
    vec![Message::system(system), Message::user(user)]
}

/// Render the relationship extraction prompt over a known entity list.
pub fn edge_messages(
    episode: &Episode,
    previous: &[Episode],
    entity_names: &[String],
) -> Vec<Message> {
    let system = "You are an assistant that extracts relationships between known \
                  entities. Only report relationships whose source and target both \
                  appear in the provided entity list, and use a short snake_case \
                  relation type.";
    let user = format!(
        "<EPISODE CONTENT>\n{}\n</EPISODE CONTENT>\n\n\
         <ENTITIES>\n{}\n</ENTITIES>\n\n\
         <PREVIOUS EPISODES>\n{}</PREVIOUS EPISODES>\n\n\
         Extract relationships between the listed entities that the episode \
         content states or implies.",
        episode.content,
        entity_names.join("\n"),
        previous_window(previous),
    );
    vec![Message::system(system), Message::user(user)]
}

/// One line per registered entity type, id first so backends can echo it.
fn entity_types_block() -> String {
    let mut block = String::new();
    for ty in ENTITY_TYPES {
        block.push_str(&format!("{}: {} - {}\n", ty.id, ty.name, ty.description));
    }
    block
}

/// Context block of prior episodes. Input is newest first, as the store
/// returns it; the rendered window is chronological and content-trimmed.
fn previous_window(previous: &[Episode]) -> String {
    let mut window = String::new();
    for episode in previous.iter().take(PREVIOUS_EPISODE_WINDOW).rev() {
        window.push_str(&format!(
            "- {}\n",
            truncate_chars(episode.content.trim(), PREVIOUS_CONTENT_CHARS)
        ));
    }
    window
}

fn missed_instruction(missed: &[String]) -> String {
    if missed.is_empty() {
        return String::new();
    }
    format!(
        "\nMake sure that the following entities are extracted:\n{}\n",
        missed.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn episode(source: EpisodeSource, content: &str) -> Episode {
        Episode::new("test", content, "unit test", "default", source)
    }

    fn older(content: &str, minutes_ago: i64) -> Episode {
        let mut ep = episode(EpisodeSource::Message, content);
        ep.created_at = Utc::now() - chrono::Duration::minutes(minutes_ago);
        ep
    }

    #[test]
    fn test_message_prompt_contains_content_and_types() {
        let ep = episode(EpisodeSource::Message, "Alice met Bob");
        let messages = extraction_messages(&ep, &[], &[]);
        assert_eq!(messages.len(), 2);
        assert!(messages[1].content.contains("<CURRENT MESSAGE>\nAlice met Bob"));
        assert!(messages[1].content.contains("1: Person"));
        assert!(messages[1].content.contains("2: Organization"));
    }

    #[test]
    fn test_text_prompt_uses_text_block() {
        let ep = episode(EpisodeSource::Text, "Some document");
        let messages = extraction_messages(&ep, &[], &[]);
        assert!(messages[1].content.contains("<TEXT>\nSome document\n</TEXT>"));
        assert!(!messages[1].content.contains("<CURRENT MESSAGE>"));
    }

    #[test]
    fn test_json_prompt_uses_json_block() {
        let ep = episode(EpisodeSource::Json, r#"{"user": "alice"}"#);
        let messages = extraction_messages(&ep, &[], &[]);
        assert!(messages[1].content.contains("<JSON>"));
    }

    #[test]
    fn test_missed_names_are_folded_in() {
        let ep = episode(EpisodeSource::Text, "doc");
        let missed = vec!["Jane Roe".to_string(), "Oak Systems".to_string()];
        let messages = extraction_messages(&ep, &[], &missed);
        let user = &messages[1].content;
        assert!(user.contains("Make sure that the following entities are extracted:"));
        assert!(user.contains("Jane Roe\nOak Systems"));
    }

    #[test]
    fn test_previous_window_is_recent_chronological_and_trimmed() {
        let long = "y".repeat(150);
        // Newest first, as the store returns them.
        let previous = vec![
            older("newest", 1),
            older(&long, 2),
            older("third", 3),
            older("too old", 4),
        ];
        let ep = episode(EpisodeSource::Message, "hi");
        let messages = extraction_messages(&ep, &previous, &[]);
        let user = &messages[1].content;
        assert!(!user.contains("too old"));
        assert!(user.contains("- third"));
        // Chronological: third before the trimmed one, trimmed one before newest.
        let third_pos = user.find("- third").unwrap();
        let long_pos = user.find("- yyy").unwrap();
        let newest_pos = user.find("- newest").unwrap();
        assert!(third_pos < long_pos && long_pos < newest_pos);
        // 100 kept chars plus ellipsis.
        let trimmed = format!("{}...", "y".repeat(100));
        assert!(user.contains(&trimmed));
        assert!(!user.contains(&"y".repeat(101)));
    }

    #[test]
    fn test_reflexion_prompt_lists_extracted_names() {
        let ep = episode(EpisodeSource::Text, "Jane Roe founded Oak Systems");
        let extracted = vec!["Jane Roe".to_string()];
        let messages = reflexion_messages(&ep, &[], &extracted);
        let user = &messages[1].content;
        assert!(user.contains(EXTRACTED_OPEN));
        assert!(user.contains("Jane Roe"));
        assert!(user.contains(EXTRACTED_CLOSE));
    }

    #[test]
    fn test_edge_prompt_lists_entities() {
        let ep = episode(EpisodeSource::Text, "Jane Roe founded Oak Systems");
        let names = vec!["Jane Roe".to_string(), "Oak Systems".to_string()];
        let messages = edge_messages(&ep, &[], &names);
        let user = &messages[1].content;
        assert!(user.contains("<ENTITIES>\nJane Roe\nOak Systems\n</ENTITIES>"));
    }

    #[test]
    fn test_no_schema_in_rendered_prompts() {
        let ep = episode(EpisodeSource::Message, "hello");
        for message in extraction_messages(&ep, &[], &[]) {
            assert!(!message.content.contains("Respond with a JSON object"));
        }
    }
}
