pub mod diagnosis; // Diagnoser → Validator → Advisor with fallback recovery
