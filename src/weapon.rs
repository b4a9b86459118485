use serde::{Serialize, Serializer};

/// Weapon types known to the trained models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeaponClass {
    Akm,
    M416,
    M16a4,
    ScarL,
    Groza,
    AugA3,
    G36c,
    K2,
    Qbz95,
    Kar98k,
    M24,
    Awm,
    Winchester,
    Sks,
    Mini14,
    Vss,
    Slr,
    Qbu88,
    Mk14,
    Ump45,
    MicroUzi,
    Vector,
    P90,
    Thompson,
    S12k,
    Dbs,
    S1897,
    M249,
    Dp28,
    P18c,
    P92,
    P1911,
    R1895,
    R45,
    DesertEagle,
    Skorpion,
    VeraLynn,
    Bizon,
    NoGun,
    Unknown,
}

struct CatalogEntry {
    class: WeaponClass,
    code: &'static str,
    name: &'static str,
    /// Muzzle report in dB SPL at 1 m.
    reference_level_db: f64,
}

const fn entry(class: WeaponClass, code: &'static str, name: &'static str, reference_level_db: f64) -> CatalogEntry {
    CatalogEntry { class, code, name, reference_level_db }
}

const CATALOG: &[CatalogEntry] = &[
    entry(WeaponClass::Akm, "ak", "AKM", 159.0),
    entry(WeaponClass::M416, "m4", "M416", 157.0),
    entry(WeaponClass::M16a4, "m16", "M16A4", 157.0),
    entry(WeaponClass::ScarL, "scar", "SCAR-L", 157.0),
    entry(WeaponClass::Groza, "gro", "Groza", 158.0),
    entry(WeaponClass::AugA3, "aug", "AUG A3", 157.0),
    entry(WeaponClass::G36c, "g36c", "G36C", 156.0),
    entry(WeaponClass::K2, "k2", "K2", 157.0),
    entry(WeaponClass::Qbz95, "qbz", "QBZ95", 156.0),
    entry(WeaponClass::Kar98k, "kar", "Kar98k", 162.0),
    entry(WeaponClass::M24, "m24", "M24", 163.0),
    entry(WeaponClass::Awm, "awm", "AWM", 168.0),
    entry(WeaponClass::Winchester, "win", "Winchester", 158.0),
    entry(WeaponClass::Sks, "sks", "SKS", 159.0),
    entry(WeaponClass::Mini14, "mini", "Mini14", 157.0),
    entry(WeaponClass::Vss, "vss", "VSS Vintorez", 130.0),
    entry(WeaponClass::Slr, "slr", "SLR", 161.0),
    entry(WeaponClass::Qbu88, "qbu", "QBU-88", 158.0),
    entry(WeaponClass::Mk14, "mk", "Mk14", 161.0),
    entry(WeaponClass::Ump45, "ump", "UMP45", 153.0),
    entry(WeaponClass::MicroUzi, "uzi", "Micro UZI", 152.0),
    entry(WeaponClass::Vector, "vec", "Vector", 152.0),
    entry(WeaponClass::P90, "p90", "P90", 154.0),
    entry(WeaponClass::Thompson, "tommy", "Thompson", 155.0),
    entry(WeaponClass::S12k, "s12k", "S12K", 160.0),
    entry(WeaponClass::Dbs, "dbs", "DBS", 160.0),
    entry(WeaponClass::S1897, "pump", "S1897", 160.0),
    entry(WeaponClass::M249, "m249", "M249", 159.0),
    entry(WeaponClass::Dp28, "dp", "DP-28", 160.0),
    entry(WeaponClass::P18c, "p18c", "P18C", 152.0),
    entry(WeaponClass::P92, "p92", "P92", 154.0),
    entry(WeaponClass::P1911, "p1911", "P1911", 156.0),
    entry(WeaponClass::R1895, "r1895", "R1895", 157.0),
    entry(WeaponClass::R45, "r45", "R45", 158.0),
    entry(WeaponClass::DesertEagle, "deagle", "Desert Eagle", 162.0),
    entry(WeaponClass::Skorpion, "scorp", "Skorpion", 151.0),
    entry(WeaponClass::VeraLynn, "verl", "Vera Lynn", 158.0),
    entry(WeaponClass::Bizon, "pp", "PP-19 Bizon", 152.0),
    entry(WeaponClass::NoGun, "nogun", "No Gun", 0.0),
];

/// Reference level used when no weapon could be identified.
pub const DEFAULT_REFERENCE_LEVEL_DB: f64 = 157.0;

impl WeaponClass {
    /// Parses either a dataset code (`ak`) or a display name (`AKM`).
    /// Anything else maps to `Unknown`.
    pub fn from_label(label: &str) -> Self {
        let label = label.trim();
        CATALOG
            .iter()
            .find(|e| e.code.eq_ignore_ascii_case(label) || e.name.eq_ignore_ascii_case(label))
            .map(|e| e.class)
            .unwrap_or(WeaponClass::Unknown)
    }

    fn entry(&self) -> Option<&'static CatalogEntry> {
        CATALOG.iter().find(|e| e.class == *self)
    }

    pub fn code(&self) -> &'static str {
        self.entry().map(|e| e.code).unwrap_or("unknown")
    }

    pub fn as_str(&self) -> &'static str {
        self.entry().map(|e| e.name).unwrap_or("Unknown")
    }

    /// Loudness used to calibrate distance estimates. `None` for classes
    /// that do not describe a firearm report.
    pub fn reference_level_db(&self) -> Option<f64> {
        match self {
            WeaponClass::NoGun | WeaponClass::Unknown => None,
            _ => self.entry().map(|e| e.reference_level_db),
        }
    }

    pub fn is_known(&self) -> bool {
        *self != WeaponClass::Unknown
    }

    pub fn all() -> impl Iterator<Item = WeaponClass> {
        CATALOG.iter().map(|e| e.class)
    }
}

impl std::fmt::Display for WeaponClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for WeaponClass {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
