use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompetitionSeries {
    GtWorldChallenge,
    IntercontinentalGtChallenge,
    BritishGtChampionship,
    AmericanTrackPack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    /// Label used for the track in server configuration and logs
    pub label: String,
    pub name: String,
    pub series: CompetitionSeries,
    pub nr_pit_boxes: u32,
    pub private_server_slots: u32,
    /// Labels used by older server versions
    pub alternate_labels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarGroup {
    Gt3,
    Gt4,
    PorscheCup,
    SuperTrofeo,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarModel {
    pub id: u32,
    pub manufacturer: String,
    pub model: String,
    pub year: u32,
    pub group: CarGroup,
}

/// Immutable lookup tables for tracks and car models.
///
/// Built once and shared through an `Arc`; nothing mutates it after construction.
#[derive(Debug, Default)]
pub struct ReferenceData {
    tracks: Vec<Arc<Track>>,
    tracks_by_label: HashMap<String, Arc<Track>>,
    car_models_by_id: HashMap<u32, Arc<CarModel>>,
}

impl ReferenceData {
    pub fn new(tracks: Vec<Track>, car_models: Vec<CarModel>) -> ReferenceData {
        let tracks: Vec<Arc<Track>> = tracks.into_iter().map(Arc::new).collect();

        let mut tracks_by_label = HashMap::new();
        for track in &tracks {
            tracks_by_label.insert(track.label.clone(), track.clone());
            for label in &track.alternate_labels {
                tracks_by_label.insert(label.clone(), track.clone());
            }
        }

        let car_models_by_id = car_models.into_iter()
            .map(|model| (model.id, Arc::new(model)))
            .collect();

        ReferenceData { tracks, tracks_by_label, car_models_by_id }
    }

    pub fn builtin() -> ReferenceData {
        ReferenceData::new(builtin_tracks(), builtin_car_models())
    }

    pub fn track_by_label(&self, label: &str) -> Option<Arc<Track>> {
        self.tracks_by_label.get(label).cloned()
    }

    pub fn car_model_by_id(&self, id: u32) -> Option<Arc<CarModel>> {
        self.car_models_by_id.get(&id).cloned()
    }

    pub fn tracks(&self) -> &[Arc<Track>] {
        &self.tracks
    }
}

fn track(label: &str, name: &str, series: CompetitionSeries, nr_pit_boxes: u32, private_server_slots: u32, alternate_labels: &[&str]) -> Track {
    Track {
        label: label.to_string(),
        name: name.to_string(),
        series,
        nr_pit_boxes,
        private_server_slots,
        alternate_labels: alternate_labels.iter().map(|label| label.to_string()).collect(),
    }
}

fn builtin_tracks() -> Vec<Track> {
    use CompetitionSeries::*;

    vec![
        track("monza", "Monza", GtWorldChallenge, 29, 60, &["monza_2019", "monza_2020"]),
        track("zolder", "Zolder", GtWorldChallenge, 34, 50, &["zolder_2019", "zolder_2020"]),
        track("brands_hatch", "Brands Hatch", GtWorldChallenge, 32, 50, &["brands_hatch_2019", "brands_hatch_2020"]),
        track("silverstone", "Silverstone", GtWorldChallenge, 36, 60, &["silverstone_2019", "silverstone_2020"]),
        track("paul_ricard", "Paul Ricard", GtWorldChallenge, 33, 80, &["paul_ricard_2019", "paul_ricard_2020"]),
        track("misano", "Misano", GtWorldChallenge, 30, 50, &["misano_2019", "misano_2020"]),
        track("spa", "Spa", GtWorldChallenge, 82, 82, &["spa_2019", "spa_2020"]),
        track("nurburgring", "Nurburgring", GtWorldChallenge, 30, 50, &["nurburgring_2019", "nurburgring_2020"]),
        track("barcelona", "Barcelona", GtWorldChallenge, 29, 50, &["barcelona_2019", "barcelona_2020"]),
        track("hungaroring", "Hungaroring", GtWorldChallenge, 27, 50, &["hungaroring_2019", "hungaroring_2020"]),
        track("zandvoort", "Zandvoort", GtWorldChallenge, 25, 50, &["zandvoort_2019", "zandvoort_2020"]),
        track("imola", "Imola", GtWorldChallenge, 30, 50, &["imola_2019", "imola_2020"]),
        track("kyalami", "Kyalami", IntercontinentalGtChallenge, 40, 50, &["kyalami_2019", "kyalami_2020"]),
        track("mount_panorama", "Mount Panorama", IntercontinentalGtChallenge, 36, 50, &["mount_panorama_2019", "mount_panorama_2020"]),
        track("suzuka", "Suzuka", IntercontinentalGtChallenge, 51, 105, &["suzuka_2019", "suzuka_2020"]),
        track("laguna_seca", "Laguna Seca", IntercontinentalGtChallenge, 30, 50, &["laguna_seca_2019", "laguna_seca_2020"]),
        track("oulton_park", "Oulton Park", BritishGtChampionship, 28, 50, &["oulton_park_2019", "oulton_park_2020"]),
        track("donington", "Donington Park", BritishGtChampionship, 37, 50, &["donington_2019", "donnington_2020"]),
        track("snetterton", "Snetterton", BritishGtChampionship, 26, 50, &["snetterton_2019", "snetterton_2020"]),
        track("cota", "Circuit of the Americas", AmericanTrackPack, 30, 70, &[]),
        track("indianapolis", "Indianapolis", AmericanTrackPack, 30, 60, &[]),
        track("watkins_glen", "Watkins Glen", AmericanTrackPack, 30, 60, &[]),
    ]
}

fn car_model(id: u32, manufacturer: &str, model: &str, year: u32, group: CarGroup) -> CarModel {
    CarModel {
        id,
        manufacturer: manufacturer.to_string(),
        model: model.to_string(),
        year,
        group,
    }
}

fn builtin_car_models() -> Vec<CarModel> {
    use CarGroup::*;

    vec![
        car_model(12, "Aston Martin", "V12 Vantage GT3", 2013, Gt3),
        car_model(20, "Aston Martin", "V8 Vantage GT3", 2019, Gt3),
        car_model(3, "Audi", "R8 LMS", 2015, Gt3),
        car_model(19, "Audi", "R8 LMS Evo", 2019, Gt3),
        car_model(11, "Bentley", "Continental GT3", 2015, Gt3),
        car_model(8, "Bentley", "Continental GT3", 2018, Gt3),
        car_model(7, "BMW", "M6 GT3", 2017, Gt3),
        car_model(14, "Emil Frey Jaguar", "G3", 2012, Gt3),
        car_model(2, "Ferrari", "488 GT3", 2018, Gt3),
        car_model(17, "Honda", "NSX GT3", 2017, Gt3),
        car_model(21, "Honda", "NSX GT3 Evo", 2019, Gt3),
        car_model(4, "Lamborghini", "Huracan GT3", 2015, Gt3),
        car_model(16, "Lamborghini", "Huracan GT3 Evo", 2019, Gt3),
        car_model(18, "Lamborghini", "Huracan Super Trofeo", 2015, SuperTrofeo),
        car_model(15, "Lexus", "RC F GT3", 2016, Gt3),
        car_model(5, "McLaren", "650S GT3", 2015, Gt3),
        car_model(22, "McLaren", "720S GT3", 2019, Gt3),
        car_model(1, "Mercedes-AMG", "GT3", 2015, Gt3),
        car_model(10, "Nissan", "GT-R Nismo GT3", 2015, Gt3),
        car_model(6, "Nissan", "GT-R Nismo GT3", 2018, Gt3),
        car_model(0, "Porsche", "991 GT3 R", 2018, Gt3),
        car_model(9, "Porsche", "991 II GT3 Cup", 2017, PorscheCup),
        car_model(23, "Porsche", "991 II GT3 R", 2019, Gt3),
        car_model(13, "Reiter Engineering", "R-EX GT3", 2017, Gt3),
        car_model(50, "Alpine", "A110 GT4", 2018, Gt4),
        car_model(51, "Aston Martin", "Vantage GT4", 2018, Gt4),
        car_model(52, "Audi", "R8 LMS GT4", 2018, Gt4),
        car_model(53, "BMW", "M4 GT4", 2018, Gt4),
        car_model(55, "Chevrolet", "Camaro GT4.R", 2017, Gt4),
        car_model(56, "Ginetta", "G55 GT4", 2012, Gt4),
        car_model(57, "KTM", "X-Bow GT4", 2016, Gt4),
        car_model(58, "Maserati", "GranTurismo MC GT4", 2016, Gt4),
        car_model(59, "McLaren", "570S GT4", 2016, Gt4),
        car_model(60, "Mercedes-AMG", "GT4", 2016, Gt4),
        car_model(61, "Porsche", "718 Cayman GT4 Clubsport", 2019, Gt4),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_tracks_by_primary_and_alternate_label() {
        let reference = ReferenceData::builtin();

        let zandvoort = reference.track_by_label("zandvoort").unwrap();
        assert_eq!("Zandvoort", zandvoort.name);
        assert_eq!(zandvoort, reference.track_by_label("zandvoort_2019").unwrap());
        assert!(reference.track_by_label("nordschleife").is_none());
    }

    #[test]
    fn resolves_car_models_by_id() {
        let reference = ReferenceData::builtin();

        let model = reference.car_model_by_id(1).unwrap();
        assert_eq!("Mercedes-AMG", model.manufacturer);
        assert_eq!(CarGroup::Gt3, model.group);
        assert_eq!(CarGroup::Gt4, reference.car_model_by_id(61).unwrap().group);
        assert!(reference.car_model_by_id(54).is_none());
    }
}
