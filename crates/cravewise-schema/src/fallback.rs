use crate::{AiResponse, CrisisInfo, PlanStep, TrendWarning};

pub const CRISIS_HOTLINES: [&str; 2] = [
    "116 123 – Telefon zaufania dla osób dorosłych w kryzysie emocjonalnym",
    "112 – Numer alarmowy w nagłych sytuacjach",
];

/// Fixed, safety-reviewed reply used whenever a model-generated plan cannot be
/// trusted. Never depends on the request that failed.
pub fn crisis_fallback() -> AiResponse {
    AiResponse {
        language: "pl".to_string(),
        summary: "Wykryto potencjalny kryzys. Skup się na swoim bezpieczeństwie.".to_string(),
        insight: "To ważne, aby w trudnych chwilach sięgnąć po pomoc.".to_string(),
        plan: vec![
            PlanStep {
                step: "Zadzwoń teraz do zaufanej osoby i powiedz: 'Jest mi bardzo ciężko, potrzebuję rozmowy'.".to_string(),
                duration: "3-5 min".to_string(),
                why: "Kontakt z bliską osobą jest kluczowy w kryzysie.".to_string(),
            },
            PlanStep {
                step: "Jeśli jesteś sam/a: weź telefon i wybierz 116 123 (pomoc kryzysowa) lub 112 w nagłym zagrożeniu.".to_string(),
                duration: "2 min".to_string(),
                why: "Specjaliści są dostępni, by Ci pomóc.".to_string(),
            },
        ],
        if_trigger_then_strategy: Vec::new(),
        motivation: "Nie jesteś z tym sam/a. Sięganie po pomoc to akt siły i odwagi.".to_string(),
        reflect_question: "Kto jest Twoją pierwszą osobą do kontaktu w trudnej sytuacji?".to_string(),
        followup_questions: Vec::new(),
        trend_warning: TrendWarning {
            is_flagged: false,
            message: String::new(),
            suggested_adjustment: String::new(),
        },
        crisis: CrisisInfo {
            is_flagged: true,
            message: "Jeśli czujesz, że Twoje życie lub zdrowie jest zagrożone, natychmiast zadzwoń pod numer 112 lub 116 123. Możesz też porozmawiać z kimś bliskim. Twoje bezpieczeństwo jest najważniejsze.".to_string(),
            hotlines: CRISIS_HOTLINES.iter().map(|h| h.to_string()).collect(),
        },
    }
}
