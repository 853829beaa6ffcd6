use serde::{Deserialize, Serialize};

use crate::common::Vector;

/// Broad weapon classes, used for grouping and win-condition logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EquipmentClass {
    #[default]
    Unknown,
    Pistols,
    Smg,
    Heavy,
    Rifle,
    Equipment,
    Grenade,
}

/// Weapon and utility taxonomy, consumed as data by the game-state layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EquipmentType {
    #[default]
    Unknown,
    // Pistols
    P2000,
    Glock,
    P250,
    Deagle,
    FiveSeven,
    DualBerettas,
    Tec9,
    Cz75,
    Usp,
    Revolver,
    // SMGs
    Mp7,
    Mp9,
    Bizon,
    Mac10,
    Ump45,
    P90,
    Mp5,
    // Heavy
    SawedOff,
    Nova,
    Mag7,
    Xm1014,
    M249,
    Negev,
    // Rifles
    Galil,
    Famas,
    Ak47,
    M4A4,
    M4A1,
    Sg553,
    Aug,
    Ssg08,
    Awp,
    Scar20,
    G3sg1,
    // Equipment
    Zeus,
    Kevlar,
    Helmet,
    Bomb,
    Knife,
    DefuseKit,
    // Grenades
    Decoy,
    Molotov,
    Incendiary,
    Flash,
    Smoke,
    He,
}

impl EquipmentType {
    pub fn class(self) -> EquipmentClass {
        use EquipmentType::*;
        match self {
            P2000 | Glock | P250 | Deagle | FiveSeven | DualBerettas | Tec9 | Cz75 | Usp
            | Revolver => EquipmentClass::Pistols,
            Mp7 | Mp9 | Bizon | Mac10 | Ump45 | P90 | Mp5 => EquipmentClass::Smg,
            SawedOff | Nova | Mag7 | Xm1014 | M249 | Negev => EquipmentClass::Heavy,
            Galil | Famas | Ak47 | M4A4 | M4A1 | Sg553 | Aug | Ssg08 | Awp | Scar20 | G3sg1 => {
                EquipmentClass::Rifle
            }
            Zeus | Kevlar | Helmet | Bomb | Knife | DefuseKit => EquipmentClass::Equipment,
            Decoy | Molotov | Incendiary | Flash | Smoke | He => EquipmentClass::Grenade,
            Unknown => EquipmentClass::Unknown,
        }
    }

    pub fn is_grenade(self) -> bool {
        self.class() == EquipmentClass::Grenade
    }

    /// Maps a weapon name as it appears in events and entity class or model
    /// names ("weapon_ak47", "smokegrenade", ...).
    pub fn from_name(name: &str) -> EquipmentType {
        use EquipmentType::*;
        let name = name
            .trim_start_matches("weapon_")
            .trim_start_matches("item_");
        match name {
            "hkp2000" | "p2000" => P2000,
            "glock" => Glock,
            "p250" => P250,
            "deagle" => Deagle,
            "fiveseven" => FiveSeven,
            "elite" => DualBerettas,
            "tec9" => Tec9,
            "cz75a" | "cz75" => Cz75,
            "usp_silencer" | "usp" => Usp,
            "revolver" => Revolver,
            "mp7" => Mp7,
            "mp9" => Mp9,
            "bizon" => Bizon,
            "mac10" => Mac10,
            "ump45" => Ump45,
            "p90" => P90,
            "mp5sd" => Mp5,
            "sawedoff" => SawedOff,
            "nova" => Nova,
            "mag7" => Mag7,
            "xm1014" => Xm1014,
            "m249" => M249,
            "negev" => Negev,
            "galilar" | "galil" => Galil,
            "famas" => Famas,
            "ak47" => Ak47,
            "m4a4" => M4A4,
            "m4a1" | "m4a1_silencer" => M4A1,
            "sg556" | "sg553" => Sg553,
            "aug" => Aug,
            "ssg08" => Ssg08,
            "awp" => Awp,
            "scar20" => Scar20,
            "g3sg1" => G3sg1,
            "taser" => Zeus,
            "kevlar" | "assaultsuit" => Kevlar,
            "c4" => Bomb,
            "defuser" => DefuseKit,
            "decoy" | "decoygrenade" => Decoy,
            "molotov" | "molotovgrenade" => Molotov,
            "incgrenade" | "incendiarygrenade" => Incendiary,
            "flashbang" => Flash,
            "smokegrenade" => Smoke,
            "hegrenade" | "fraggrenade" => He,
            other if other.contains("knife") || other.contains("bayonet") => Knife,
            _ => Unknown,
        }
    }

    /// Maps an entity class name ("CAK47", "CWeaponAWP", "CSmokeGrenade").
    pub fn from_class_name(class_name: &str) -> EquipmentType {
        let stripped = class_name
            .trim_start_matches("CWeapon")
            .trim_start_matches('C');
        let lowered = stripped
            .trim_end_matches("Projectile")
            .trim_end_matches("Grenade")
            .to_ascii_lowercase();
        match lowered.as_str() {
            "ak47" => EquipmentType::Ak47,
            "awp" => EquipmentType::Awp,
            "aug" => EquipmentType::Aug,
            "deagle" => EquipmentType::Deagle,
            "flashbang" | "flash" => EquipmentType::Flash,
            "smoke" => EquipmentType::Smoke,
            "he" | "hegrenade" => EquipmentType::He,
            "molotov" => EquipmentType::Molotov,
            "incendiary" => EquipmentType::Incendiary,
            "decoy" => EquipmentType::Decoy,
            "c4" => EquipmentType::Bomb,
            _ => EquipmentType::from_name(&lowered),
        }
    }
}

/// One weapon instance tracked over its dropped/held lifecycle.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Equipment {
    pub entity_id: i32,
    pub eq_type: EquipmentType,
    pub owner_user_id: Option<i32>,
    pub position: Vector,
    pub ammo_in_magazine: i32,
}

/// A grenade between throw and detonation.
#[derive(Debug, Clone, Default)]
pub struct GrenadeProjectile {
    pub entity_id: i32,
    pub eq_type: EquipmentType,
    pub thrower_user_id: Option<i32>,
    pub owner_user_id: Option<i32>,
    pub trajectory: Vec<Vector>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_map_to_types_and_classes() {
        assert_eq!(EquipmentType::from_name("weapon_ak47"), EquipmentType::Ak47);
        assert_eq!(
            EquipmentType::from_name("weapon_ak47").class(),
            EquipmentClass::Rifle
        );
        assert_eq!(
            EquipmentType::from_name("smokegrenade"),
            EquipmentType::Smoke
        );
        assert_eq!(
            EquipmentType::from_name("weapon_knife_butterfly"),
            EquipmentType::Knife
        );
        assert_eq!(EquipmentType::from_name("banana"), EquipmentType::Unknown);
    }

    #[test]
    fn class_names_map_to_types() {
        assert_eq!(
            EquipmentType::from_class_name("CAK47"),
            EquipmentType::Ak47
        );
        assert_eq!(
            EquipmentType::from_class_name("CSmokeGrenadeProjectile"),
            EquipmentType::Smoke
        );
        assert_eq!(
            EquipmentType::from_class_name("CFlashbangProjectile"),
            EquipmentType::Flash
        );
    }

    #[test]
    fn grenades_are_grenades() {
        assert!(EquipmentType::Flash.is_grenade());
        assert!(!EquipmentType::Awp.is_grenade());
    }
}
