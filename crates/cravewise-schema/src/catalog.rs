use serde::{Deserialize, Serialize};

/// A substance (or behaviour) the user is abstaining from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Substance {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default)]
    pub symptoms: Vec<String>,
}

/// A built-in substance preset.
#[derive(Debug, Clone, Serialize)]
pub struct SubstancePreset {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub triggers: &'static [&'static str],
    pub symptoms: &'static [&'static str],
}

impl SubstancePreset {
    pub fn to_substance(&self) -> Substance {
        Substance {
            id: self.id.to_string(),
            name: self.name.to_string(),
            description: self.description.to_string(),
            triggers: self.triggers.iter().map(|t| t.to_string()).collect(),
            symptoms: self.symptoms.iter().map(|s| s.to_string()).collect(),
        }
    }
}

pub const SUBSTANCE_PRESETS: &[SubstancePreset] = &[
    SubstancePreset {
        id: "nikotyna",
        name: "Nikotyna",
        description: "Papierosy, e-papierosy, tytoń",
        triggers: &["Stres", "Kawa", "Alkohol", "Zakończenie posiłku", "Przerwa w pracy", "Nuda"],
        symptoms: &["Niepokój", "Drażliwość", "Trudności z koncentracją", "Zwiększony apetyt", "Chęć zapalenia"],
    },
    SubstancePreset {
        id: "alkohol",
        name: "Alkohol",
        description: "Piwo, wino, wódka, etc.",
        triggers: &["Spotkania towarzyskie", "Stres", "Smutek", "Nuda", "Oglądanie sportu", "Koniec tygodnia"],
        symptoms: &["Silna chęć picia", "Pocenie się", "Drżenie rąk", "Lęk", "Problemy ze snem", "Nudności"],
    },
    SubstancePreset {
        id: "kofeina",
        name: "Kofeina",
        description: "Kawa, herbata, napoje energetyczne",
        triggers: &["Poranek", "Zmęczenie", "Praca umysłowa", "Nawyk", "Spotkania przy kawie"],
        symptoms: &["Ból głowy", "Zmęczenie", "Drażliwość", "Trudności z koncentracją", "Obniżony nastrój"],
    },
    SubstancePreset {
        id: "kannabinoidy",
        name: "Kannabinoidy",
        description: "Marihuana, haszysz",
        triggers: &["Relaks", "Nuda", "Spotkania z przyjaciółmi", "Słuchanie muzyki", "Stres"],
        symptoms: &["Drażliwość", "Lęk", "Problemy ze snem", "Utrata apetytu", "Niepokój fizyczny"],
    },
    SubstancePreset {
        id: "stymulanty",
        name: "Stymulanty",
        description: "Amfetamina, kokaina, etc.",
        triggers: &["Imprezy", "Chęć zwiększenia energii", "Stres", "Niska samoocena", "Zmęczenie"],
        symptoms: &["Silne pragnienie zażycia", "Zmęczenie i wyczerpanie", "Depresja", "Zwiększony apetyt", "Koszmary senne"],
    },
    SubstancePreset {
        id: "opioidy",
        name: "Opioidy",
        description: "Heroina, morfina, leki przeciwbólowe",
        triggers: &["Ból fizyczny", "Stres emocjonalny", "Unikanie objawów odstawienia", "Samotność"],
        symptoms: &["Bóle mięśni", "Niepokój", "Ziewanie", "Bezsenność", "Katar", "Gęsia skórka"],
    },
    SubstancePreset {
        id: "hazard",
        name: "Hazard",
        description: "Gry losowe, zakłady bukmacherskie",
        triggers: &["Nuda", "Stres", "Samotność", "Reklamy hazardowe", "Dostęp do pieniędzy", "Alkohol"],
        symptoms: &["Silna chęć gry", "Myśli o wygranej", "Podniecenie na myśl o grze", "Ukrywanie grania", "Pożyczanie pieniędzy na grę"],
    },
];

pub fn find_substance(id: &str) -> Option<Substance> {
    SUBSTANCE_PRESETS
        .iter()
        .find(|preset| preset.id == id)
        .map(SubstancePreset::to_substance)
}

/// A loggable symptom with its default label and substance-specific overrides.
#[derive(Debug, Clone, Serialize)]
pub struct SymptomDefinition {
    pub key: &'static str,
    pub default_label: &'static str,
    pub overrides: &'static [(&'static str, &'static str)],
}

impl SymptomDefinition {
    pub fn label_for(&self, substance_id: &str) -> &'static str {
        self.overrides
            .iter()
            .find(|(id, _)| *id == substance_id)
            .map(|(_, label)| *label)
            .unwrap_or(self.default_label)
    }
}

const fn plain(key: &'static str, default_label: &'static str) -> SymptomDefinition {
    SymptomDefinition {
        key,
        default_label,
        overrides: &[],
    }
}

pub const SYMPTOMS: &[SymptomDefinition] = &[
    plain("memory_problems", "Problemy z pamięcią"),
    plain("concentration_problems", "Problemy z koncentracją"),
    plain("thinking_difficulties", "Trudności z myśleniem, chaos w myśleniu"),
    plain("tension", "Napięcie"),
    plain("irritability", "Rozdrażnienie, irytacja, złość"),
    plain("reluctance", "Niechęć"),
    plain("apathy", "Apatia, przygnębienie"),
    plain("feeling_of_lack", "Uczucie braku czegoś"),
    plain("loneliness", "Uczucie osamotnienia"),
    plain("quarrelsomeness", "Kłótliwość, konflikty, czepianie się"),
    plain("indifference", "Obojętność, znudzenie"),
    plain("euphoria", "Euforia, wesołkowatość"),
    plain("hyperactivity", "Nadpobudliwość"),
    plain("self_pity", "Użalanie się nad sobą"),
    plain("insincerity", "Nieszczerość, ukrywanie problemów"),
    plain("rejecting_help", "Odrzucanie pomocy"),
    SymptomDefinition {
        key: "doubting_treatment",
        default_label: "Podważanie sensu leczenia, myśli o rezygnacji",
        overrides: &[
            ("alkohol", "Podważanie sensu trzeźwienia, myśli o rezygnacji"),
            ("nikotyna", "Podważanie sensu rzucania palenia, myśli o rezygnacji"),
            ("hazard", "Podważanie sensu niegrania, myśli o rezygnacji"),
        ],
    },
    SymptomDefinition {
        key: "decreased_engagement",
        default_label: "Spadek zaangażowania w zdrowienie",
        overrides: &[("alkohol", "Spadek zaangażowania w trzeźwienie")],
    },
    SymptomDefinition {
        key: "substance_dreams",
        default_label: "Sny o zażywaniu substancji",
        overrides: &[
            ("alkohol", "Sny alkoholowe"),
            ("nikotyna", "Sny o paleniu"),
            ("kannabinoidy", "Sny o paleniu"),
            ("hazard", "Sny o graniu / wygranej"),
        ],
    },
    SymptomDefinition {
        key: "dry_hangover",
        default_label: "Suchy kac",
        overrides: &[("hazard", "Uczucie \"przegranej\" bez grania")],
    },
    SymptomDefinition {
        key: "smell_taste_of_substance",
        default_label: "Zapach, smak substancji",
        overrides: &[
            ("alkohol", "Zapach, smak alkoholu"),
            ("nikotyna", "Zapach dymu papierosowego"),
            ("hazard", "Bodźce przypominające o grze (dźwięki, obrazy)"),
        ],
    },
    plain("stomach_craving", "Ssanie w żołądku"),
    SymptomDefinition {
        key: "obsessive_thoughts",
        default_label: "Natrętne myślenie o substancji",
        overrides: &[
            ("alkohol", "Natrętne myślenie o piciu"),
            ("nikotyna", "Natrętne myślenie o paleniu"),
            ("hazard", "Natrętne myślenie o graniu"),
        ],
    },
    SymptomDefinition {
        key: "recalling_pleasure",
        default_label: "Przypominanie sobie przyjemnego stanu po zażyciu",
        overrides: &[
            ("alkohol", "Przypominanie sobie przyjemnego stanu po wypiciu"),
            ("nikotyna", "Przypominanie sobie przyjemności palenia"),
            ("hazard", "Przypominanie sobie euforii związanej z grą/wygraną"),
        ],
    },
    plain("overeating", "Objadanie się"),
    plain("increased_smoking_coffee", "Zwiększenie palenia lub picia kawy"),
    plain("sleep_disturbances", "Zaburzenia snu"),
    plain("exaggerating_problems", "Wyolbrzymianie problemów"),
    plain("unreliable_performance", "Nierzetelne wykonywanie obowiązków/zadań"),
    plain("focusing_on_others", "Skupienie się na innych, odwracanie uwagi"),
    SymptomDefinition {
        key: "joking_about_use",
        default_label: "Zaśmiewanie brania, żarty na temat nałogu",
        overrides: &[
            ("alkohol", "Żarty na temat picia"),
            ("hazard", "Żarty na temat grania / przegranych"),
        ],
    },
    SymptomDefinition {
        key: "strong_immediate_need",
        default_label: "Silna, natychmiastowa potrzeba zażycia",
        overrides: &[
            ("alkohol", "Silna, natychmiastowa potrzeba wypicia"),
            ("nikotyna", "Silna, natychmiastowa chęć zapalenia"),
            ("hazard", "Silna, natychmiastowa potrzeba zagrania"),
        ],
    },
];

/// Label for a symptom key as shown for the given substance; unknown keys fall back to the key.
pub fn symptom_label<'a>(key: &'a str, substance_id: &str) -> &'a str {
    SYMPTOMS
        .iter()
        .find(|def| def.key == key)
        .map(|def| def.label_for(substance_id))
        .unwrap_or(key)
}
