use std::path::Path;

use crate::dialogue::DialogueEntry;
use crate::missions::MissionDefinition;

/// Content definitions ship as JSON under `<root>/data/`. A missing file
/// means an empty content set, not an error; a malformed file is fatal so a
/// bad deploy is caught at boot instead of at first use.
pub fn load_mission_definitions(path: &Path) -> Result<Vec<MissionDefinition>, String> {
    load_json(path, "mission definitions")
}

pub fn load_dialogue_entries(path: &Path) -> Result<Vec<DialogueEntry>, String> {
    load_json(path, "dialogue entries")
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path, label: &str) -> Result<Vec<T>, String> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(format!(
                "{} read failed for {}: {}",
                label,
                path.display(),
                err
            ))
        }
    };
    serde_json::from_str(&data)
        .map_err(|err| format!("{} parse failed for {}: {}", label, path.display(), err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_empty_set() {
        let path = std::env::temp_dir().join("reality-defs-missing.json");
        let _ = std::fs::remove_file(&path);
        let missions = load_mission_definitions(&path).expect("load");
        assert!(missions.is_empty());
    }

    #[test]
    fn mission_definitions_parse_from_json() {
        let path = std::env::temp_dir().join(format!(
            "reality-defs-missions-{}.json",
            std::process::id()
        ));
        std::fs::write(
            &path,
            r#"[
                {
                    "id": 7001,
                    "name": "Data Courier",
                    "min_level": 5,
                    "repeatable": true,
                    "cooldown_secs": 3600,
                    "reward_experience": 1000,
                    "objectives": [
                        {"id": 1, "description": "Deliver", "target_value": 3},
                        {"id": 2, "description": "Unseen", "target_value": 1, "optional": true}
                    ],
                    "prerequisites": [
                        {"Profession": 2},
                        {"SkillLevel": {"skill_id": 4, "level": 2}}
                    ]
                }
            ]"#,
        )
        .expect("write");
        let missions = load_mission_definitions(&path).expect("load");
        assert_eq!(missions.len(), 1);
        let mission = &missions[0];
        assert_eq!(mission.id, 7001);
        assert_eq!(mission.min_level, 5);
        assert!(mission.repeatable);
        assert_eq!(mission.objectives.len(), 2);
        assert!(mission.objectives[1].optional);
        assert_eq!(mission.prerequisites.len(), 2);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn dialogue_entries_parse_from_json() {
        let path = std::env::temp_dir().join(format!(
            "reality-defs-dialogue-{}.json",
            std::process::id()
        ));
        std::fs::write(
            &path,
            r#"[
                {
                    "id": 500,
                    "npc_id": 5000,
                    "text": "You already know what I am going to say.",
                    "initial": true,
                    "options": [
                        {
                            "id": 3,
                            "text": "The package is delivered.",
                            "next_dialogue_id": 501,
                            "required_mission_id": 7001,
                            "required_mission_state": 2
                        }
                    ],
                    "actions": [{"GiveItem": 9100}]
                }
            ]"#,
        )
        .expect("write");
        let entries = load_dialogue_entries(&path).expect("load");
        assert_eq!(entries.len(), 1);
        assert!(entries[0].initial);
        assert_eq!(entries[0].options[0].required_mission_state, 2);
        assert_eq!(entries[0].actions.len(), 1);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn malformed_json_is_fatal() {
        let path = std::env::temp_dir().join(format!(
            "reality-defs-bad-{}.json",
            std::process::id()
        ));
        std::fs::write(&path, "{ not json").expect("write");
        assert!(load_dialogue_entries(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
