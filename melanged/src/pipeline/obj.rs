//! OBJ structure analysis for downloaded avatars.
//!
//! Counts geometry, collects groups and materials, classifies body parts
//! from group names, and infers the rig type when the platform's avatar
//! config is silent.

use std::path::Path;

use melange_common::errors::{HubError, HubResult};
use serde::Serialize;

/// One `g` group from the OBJ, with its inferred body part.
#[derive(Debug, Clone, Serialize)]
pub struct ObjGroup {
    pub name: String,
    pub line: usize,
    pub part: &'static str,
}

/// Summary of an OBJ file's structure.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ObjStructure {
    pub vertices: usize,
    pub faces: usize,
    pub normals: usize,
    pub texture_coords: usize,
    pub groups: Vec<ObjGroup>,
    pub materials: Vec<String>,
    pub body_parts: Vec<ObjGroup>,
}

/// Parse an OBJ file and summarize its structure.
pub fn analyze_obj(path: &Path) -> HubResult<ObjStructure> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| HubError::storage("read obj", format!("{}: {err}", path.display())))?;

    let mut result = ObjStructure::default();
    for (line_number, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line.starts_with("v ") {
            result.vertices += 1;
        } else if line.starts_with("vn ") {
            result.normals += 1;
        } else if line.starts_with("vt ") {
            result.texture_coords += 1;
        } else if line.starts_with("f ") {
            result.faces += 1;
        } else if let Some(name) = line.strip_prefix("g ") {
            let name = name.trim().to_string();
            let group = ObjGroup {
                part: classify_body_part(&name),
                line: line_number + 1,
                name,
            };
            if group.part != "unknown" {
                result.body_parts.push(group.clone());
            }
            result.groups.push(group);
        } else if let Some(material) = line.strip_prefix("usemtl ") {
            let material = material.trim().to_string();
            if !material.is_empty() && !result.materials.contains(&material) {
                result.materials.push(material);
            }
        }
    }
    Ok(result)
}

/// Map a group name to a body part. The platform names groups
/// `player1..player15` in rig order; community exports use descriptive
/// names instead, so both vocabularies are matched.
pub fn classify_body_part(group_name: &str) -> &'static str {
    let name = group_name.to_lowercase();
    const MAPPING: &[(&str, &[&str])] = &[
        ("head", &["player1", "head"]),
        ("torso", &["player2", "torso", "chest"]),
        ("left_arm", &["player3", "leftarm", "left_arm"]),
        ("right_arm", &["player4", "rightarm", "right_arm"]),
        ("left_leg", &["player5", "leftleg", "left_leg"]),
        ("right_leg", &["player6", "rightleg", "right_leg"]),
        ("hat", &["player7", "hat", "cap", "helmet"]),
        ("hair", &["player8", "hair"]),
        ("face", &["player9", "face"]),
        ("shirt", &["player10", "shirt", "top"]),
        ("pants", &["player11", "pants", "bottom"]),
        ("shoes", &["player12", "shoes", "boot"]),
        ("accessory", &["player13", "player14", "player15", "accessory", "gear"]),
        ("handle", &["handle", "grip", "tool"]),
    ];
    for (part, keys) in MAPPING {
        if keys.iter().any(|key| name.contains(key)) {
            return part;
        }
    }
    "unknown"
}

/// Heuristic rig inference from group names, used only when the avatar
/// config endpoint gave no answer. R15 exports split limbs into
/// upper/lower segments; R6 rigs have few, coarse groups.
pub fn infer_rig(structure: &ObjStructure) -> &'static str {
    const R15_MARKERS: &[&str] = &[
        "upper", "lower", "hand", "foot", "upperarm", "lowerarm", "upperleg", "lowerleg",
    ];
    let names: Vec<String> = structure
        .groups
        .iter()
        .map(|g| g.name.to_lowercase())
        .collect();
    if names
        .iter()
        .any(|name| R15_MARKERS.iter().any(|marker| name.contains(marker)))
    {
        return "R15";
    }
    if !names.is_empty() && names.len() <= 8 {
        return "R6";
    }
    "Unknown"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_obj(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("avatar.obj");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        (dir, path)
    }

    const R6_OBJ: &str = "\
# exported avatar
v 0 0 0
v 1 0 0
v 0 1 0
vn 0 0 1
vt 0 0
g Player1
usemtl Player1Mtl
f 1 2 3
g Player2
usemtl Player2Mtl
f 1 2 3
";

    #[test]
    fn counts_and_groups() {
        let (_dir, path) = write_obj(R6_OBJ);
        let structure = analyze_obj(&path).unwrap();
        assert_eq!(structure.vertices, 3);
        assert_eq!(structure.faces, 2);
        assert_eq!(structure.normals, 1);
        assert_eq!(structure.texture_coords, 1);
        assert_eq!(structure.groups.len(), 2);
        assert_eq!(structure.materials, vec!["Player1Mtl", "Player2Mtl"]);
        assert_eq!(structure.body_parts[0].part, "head");
        assert_eq!(structure.body_parts[1].part, "torso");
    }

    #[test]
    fn body_part_classification_covers_both_vocabularies() {
        assert_eq!(classify_body_part("Player1"), "head");
        assert_eq!(classify_body_part("player15"), "accessory");
        assert_eq!(classify_body_part("LeftArm"), "left_arm");
        assert_eq!(classify_body_part("Handle1"), "handle");
        assert_eq!(classify_body_part("Mystery"), "unknown");
    }

    #[test]
    fn rig_inference() {
        let (_dir, path) = write_obj(R6_OBJ);
        let structure = analyze_obj(&path).unwrap();
        assert_eq!(infer_rig(&structure), "R6");

        let r15 = "g UpperTorso\ng LowerTorso\ng LeftUpperArm\n";
        let (_dir, path) = write_obj(r15);
        let structure = analyze_obj(&path).unwrap();
        assert_eq!(infer_rig(&structure), "R15");

        let empty = ObjStructure::default();
        assert_eq!(infer_rig(&empty), "Unknown");
    }

    #[test]
    fn duplicate_materials_are_collapsed() {
        let obj = "usemtl A\nusemtl A\nusemtl B\n";
        let (_dir, path) = write_obj(obj);
        let structure = analyze_obj(&path).unwrap();
        assert_eq!(structure.materials, vec!["A", "B"]);
    }
}
