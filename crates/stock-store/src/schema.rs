/// DDL for the product table and its change-notification trigger.
pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS produit (
    id SERIAL PRIMARY KEY,
    ean VARCHAR(13) NOT NULL UNIQUE,
    nom TEXT NOT NULL,
    quantite INTEGER NOT NULL DEFAULT 0,
    prix NUMERIC(10, 2) NOT NULL
);

CREATE OR REPLACE FUNCTION notify_produit_quantite() RETURNS trigger AS $$
BEGIN
    PERFORM pg_notify(
        TG_ARGV[0],
        json_build_object('ean', NEW.ean, 'nom', NEW.nom, 'quantite', NEW.quantite)::text
    );
    RETURN NEW;
END;
$$ LANGUAGE plpgsql;
"#;

/// Full install script: tables, function, and a trigger that notifies
/// `channel` after every quantity update.
pub fn install_script(channel: &str) -> String {
    format!(
        "{CREATE_TABLES}
DROP TRIGGER IF EXISTS produit_quantite_updated ON produit;
CREATE TRIGGER produit_quantite_updated
    AFTER UPDATE OF quantite ON produit
    FOR EACH ROW EXECUTE FUNCTION notify_produit_quantite({});
",
        quote_literal(channel)
    )
}

/// Quote a value as an SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
