//! Lookup of the generator, scanner and rules registered per game type and
//! sheet type.

use std::{collections::HashMap, sync::Arc};

use thiserror::Error;

use super::{
    generator::{DocumentGenerator, PdfSheetGenerator},
    ocr::OcrEngine,
    scanner::{DocumentScanner, OcrSheetScanner},
};
use crate::{
    dao::models::{GameType, SheetType},
    games::{GameRules, adventure::AdventureRules},
};

/// No processor is registered for the requested key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no processor registered for game type {game_type} (sheet type {sheet_type:?})")]
pub struct UnsupportedSheet {
    pub game_type: GameType,
    pub sheet_type: Option<SheetType>,
}

/// Generator and scanner pair of one `(game_type, sheet_type)`.
#[derive(Clone)]
pub struct Processors {
    pub generator: Arc<dyn DocumentGenerator>,
    pub scanner: Arc<dyn DocumentScanner>,
}

/// Immutable mapping from game and sheet types to their processors and rules.
/// Built once at startup and shared read-only.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<(GameType, SheetType), Processors>,
    scanners: HashMap<SheetType, Arc<dyn DocumentScanner>>,
    rules: HashMap<GameType, Arc<dyn GameRules>>,
}

impl ProcessorRegistry {
    /// Registry with every built-in game type, scanning through `ocr`.
    pub fn with_defaults(ocr: Arc<dyn OcrEngine>) -> Self {
        let mut registry = Self::default();
        registry.register_rules(Arc::new(AdventureRules));
        for sheet_type in SheetType::ALL {
            registry.register(
                GameType::Adventure,
                Arc::new(PdfSheetGenerator::new(*sheet_type)),
                Arc::new(OcrSheetScanner::new(*sheet_type, ocr.clone())),
            );
        }
        registry
    }

    /// Register the processors of one sheet type of `game_type`.
    pub fn register(
        &mut self,
        game_type: GameType,
        generator: Arc<dyn DocumentGenerator>,
        scanner: Arc<dyn DocumentScanner>,
    ) -> &mut Self {
        let sheet_type = generator.sheet_type();
        self.scanners.insert(scanner.sheet_type(), scanner.clone());
        self.processors
            .insert((game_type, sheet_type), Processors { generator, scanner });
        self
    }

    /// Register the rules of a game type.
    pub fn register_rules(&mut self, rules: Arc<dyn GameRules>) -> &mut Self {
        self.rules.insert(rules.game_type(), rules);
        self
    }

    /// Processors of `(game_type, sheet_type)`.
    pub fn lookup(
        &self,
        game_type: GameType,
        sheet_type: SheetType,
    ) -> Result<&Processors, UnsupportedSheet> {
        self.processors
            .get(&(game_type, sheet_type))
            .ok_or(UnsupportedSheet {
                game_type,
                sheet_type: Some(sheet_type),
            })
    }

    /// Rules (and resolver) of `game_type`.
    pub fn rules(&self, game_type: GameType) -> Result<Arc<dyn GameRules>, UnsupportedSheet> {
        self.rules.get(&game_type).cloned().ok_or(UnsupportedSheet {
            game_type,
            sheet_type: None,
        })
    }

    /// Scanners to try on an inbound image: the hinted sheet type first, then
    /// every other registered type in declaration order.
    pub fn scanners_in_order(&self, hint: Option<SheetType>) -> Vec<Arc<dyn DocumentScanner>> {
        hint.into_iter()
            .chain(
                SheetType::ALL
                    .iter()
                    .copied()
                    .filter(|sheet_type| Some(*sheet_type) != hint),
            )
            .filter_map(|sheet_type| self.scanners.get(&sheet_type).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sheets::ocr::EmbeddedTextOcr;

    fn registry() -> ProcessorRegistry {
        ProcessorRegistry::with_defaults(Arc::new(EmbeddedTextOcr))
    }

    #[test]
    fn every_adventure_sheet_type_has_processors() {
        let registry = registry();
        for sheet_type in SheetType::ALL {
            let processors = registry.lookup(GameType::Adventure, *sheet_type).unwrap();
            assert_eq!(processors.generator.sheet_type(), *sheet_type);
            assert_eq!(processors.scanner.sheet_type(), *sheet_type);
        }
        assert!(registry.rules(GameType::Adventure).is_ok());
    }

    #[test]
    fn missing_key_is_unsupported() {
        let empty = ProcessorRegistry::default();
        assert_eq!(
            empty
                .lookup(GameType::Adventure, SheetType::LocationChoice)
                .err(),
            Some(UnsupportedSheet {
                game_type: GameType::Adventure,
                sheet_type: Some(SheetType::LocationChoice),
            })
        );
        assert!(empty.rules(GameType::Adventure).is_err());
    }

    #[test]
    fn hinted_scanner_comes_first() {
        let order: Vec<_> = registry()
            .scanners_in_order(Some(SheetType::InventoryManagement))
            .iter()
            .map(|scanner| scanner.sheet_type())
            .collect();
        assert_eq!(
            order,
            vec![SheetType::InventoryManagement, SheetType::LocationChoice]
        );

        let order: Vec<_> = registry()
            .scanners_in_order(None)
            .iter()
            .map(|scanner| scanner.sheet_type())
            .collect();
        assert_eq!(order, SheetType::ALL.to_vec());
    }
}
