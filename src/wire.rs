// Provider response shapes and their conversion into domain tours.
// Search responses arrive as XML, hot tours and reference lists as JSON.

use crate::tour::TourResult;
use serde::{Deserialize, Deserializer, Serialize};

// Structures for XML deserialization
#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct XmlSearchStart {
    pub requestid: String,
    pub result: Option<XmlSearchStartResult>,
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct XmlSearchStartResult {
    pub requestid: String,
}

impl XmlSearchStart {
    pub fn request_id(&self) -> Option<&str> {
        let nested = self.result.as_ref().map(|result| result.requestid.trim());
        [Some(self.requestid.trim()), nested]
            .into_iter()
            .flatten()
            .find(|id| !id.is_empty())
    }
}

// result.php answers with <data> either as the root or wrapped once
#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct XmlResultEnvelope {
    pub data: Option<XmlResultData>,
    pub status: Option<XmlStatus>,
    pub result: Option<XmlResultList>,
}

impl XmlResultEnvelope {
    pub fn into_data(self) -> XmlResultData {
        match self.data {
            Some(data) => data,
            None => XmlResultData {
                status: self.status,
                result: self.result,
            },
        }
    }
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct XmlResultData {
    pub status: Option<XmlStatus>,
    pub result: Option<XmlResultList>,
}

#[derive(Debug, PartialEq, Default, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct XmlStatus {
    pub state: String,
    pub hotelsfound: String,
    pub toursfound: String,
    pub minprice: String,
    pub progress: String,
    pub timepassed: String,
}

impl XmlStatus {
    pub fn is_finished(&self) -> bool {
        self.state.trim().eq_ignore_ascii_case("finished")
    }

    pub fn progress_percent(&self) -> Option<u8> {
        self.progress
            .trim()
            .parse::<u32>()
            .ok()
            .map(|value| value.min(100) as u8)
    }

    pub fn hotels_found(&self) -> usize {
        self.hotelsfound.trim().parse().unwrap_or(0)
    }

    pub fn tours_found(&self) -> usize {
        self.toursfound.trim().parse().unwrap_or(0)
    }
}

#[derive(Debug, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct XmlResultList {
    #[serde(rename = "hotel")]
    pub hotels: Vec<XmlHotel>,
}

#[derive(Debug, PartialEq, Default, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct XmlHotel {
    pub hotelcode: String,
    pub hotelname: String,
    pub hotelstars: String,
    pub countrycode: String,
    pub countryname: String,
    pub regioncode: String,
    pub regionname: String,
    pub price: String,
    pub tours: XmlTours,
}

#[derive(Debug, PartialEq, Default, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct XmlTours {
    #[serde(rename = "tour")]
    pub tours: Vec<XmlTour>,
}

#[derive(Debug, PartialEq, Default, Deserialize, Clone, Serialize)]
#[serde(default)]
pub struct XmlTour {
    pub operatorcode: String,
    pub operatorname: String,
    pub flydate: String,
    pub nights: String,
    pub price: String,
    pub meal: String,
    pub mealrussian: String,
    pub currency: String,
    pub tourid: String,
}

impl XmlHotel {
    /// Flattens a hotel and its offers into tours, one per offer. The result
    /// list does not repeat the departure per hotel, so those fields stay empty.
    pub fn into_tours(self) -> Vec<TourResult> {
        let stars = parse_stars(&self.hotelstars);
        let XmlHotel {
            hotelcode,
            hotelname,
            countrycode,
            countryname,
            regioncode,
            regionname,
            tours,
            ..
        } = self;

        tours
            .tours
            .into_iter()
            .map(|tour| TourResult {
                hotel_code: hotelcode.clone(),
                hotel_name: hotelname.clone(),
                hotel_stars: stars,
                country_code: countrycode.clone(),
                country_name: countryname.clone(),
                region_code: regioncode.clone(),
                region_name: regionname.clone(),
                departure_code: String::new(),
                departure_name: String::new(),
                operator_code: tour.operatorcode,
                operator_name: tour.operatorname,
                meal: prefer_non_empty(tour.mealrussian, tour.meal),
                price: parse_price(&tour.price),
                currency: non_empty(tour.currency),
                fly_date: tour.flydate,
                nights: tour.nights.trim().parse().unwrap_or(0),
                source: None,
            })
            .collect()
    }
}

// Hot tours come back as {"hottours": {"tour": [...]}} or {"hottours": [...]}
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HotToursResponse {
    pub hottours: Option<HotToursBody>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum HotToursBody {
    Wrapped { tour: OneOrMany<HotTour> },
    Bare(Vec<HotTour>),
}

impl HotToursResponse {
    pub fn into_tours(self) -> Vec<TourResult> {
        let raw = match self.hottours {
            Some(HotToursBody::Wrapped { tour }) => tour.into_vec(),
            Some(HotToursBody::Bare(tours)) => tours,
            None => Vec::new(),
        };
        raw.into_iter().map(HotTour::into_tour).collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(items) => items,
            OneOrMany::One(item) => vec![item],
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct HotTour {
    #[serde(deserialize_with = "lenient_string")]
    pub countrycode: String,
    #[serde(deserialize_with = "lenient_string")]
    pub countryname: String,
    #[serde(deserialize_with = "lenient_string")]
    pub departurecode: String,
    #[serde(deserialize_with = "lenient_string")]
    pub departurename: String,
    #[serde(deserialize_with = "lenient_string")]
    pub operatorcode: String,
    #[serde(deserialize_with = "lenient_string")]
    pub operatorname: String,
    #[serde(deserialize_with = "lenient_string")]
    pub hotelcode: String,
    #[serde(deserialize_with = "lenient_string")]
    pub hotelname: String,
    #[serde(deserialize_with = "lenient_string")]
    pub hotelstars: String,
    #[serde(deserialize_with = "lenient_string")]
    pub hotelregioncode: String,
    #[serde(deserialize_with = "lenient_string")]
    pub hotelregionname: String,
    #[serde(deserialize_with = "lenient_string")]
    pub flydate: String,
    #[serde(deserialize_with = "lenient_string")]
    pub nights: String,
    #[serde(deserialize_with = "lenient_string")]
    pub meal: String,
    #[serde(deserialize_with = "lenient_string")]
    pub price: String,
    #[serde(deserialize_with = "lenient_string")]
    pub currency: String,
}

impl HotTour {
    pub fn into_tour(self) -> TourResult {
        TourResult {
            hotel_stars: parse_stars(&self.hotelstars),
            price: parse_price(&self.price),
            nights: self.nights.trim().parse().unwrap_or(0),
            hotel_code: self.hotelcode,
            hotel_name: self.hotelname,
            country_code: self.countrycode,
            country_name: self.countryname,
            region_code: self.hotelregioncode,
            region_name: self.hotelregionname,
            departure_code: self.departurecode,
            departure_name: self.departurename,
            operator_code: self.operatorcode,
            operator_name: self.operatorname,
            meal: self.meal,
            currency: non_empty(self.currency),
            fly_date: self.flydate,
            source: None,
        }
    }
}

// Reference lists: {"lists": {"<kind>s": {"<kind>": [{"id": .., "name": ..}]}}}
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReferenceItem {
    #[serde(deserialize_with = "lenient_string")]
    pub id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: String,
}

pub fn parse_reference_list(
    body: &serde_json::Value,
    plural: &str,
    singular: &str,
) -> Option<Vec<ReferenceItem>> {
    let node = body.get("lists")?.get(plural)?;
    let items = node.get(singular).unwrap_or(node);
    let items = match items {
        serde_json::Value::Array(_) => items.clone(),
        serde_json::Value::Object(_) => serde_json::Value::Array(vec![items.clone()]),
        _ => return None,
    };
    serde_json::from_value(items).ok()
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_json::Value::String(text) => text,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    })
}

fn parse_price(raw: &str) -> f64 {
    raw.trim().replace(' ', "").parse().unwrap_or(0.0)
}

fn parse_stars(raw: &str) -> u8 {
    raw.trim()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .unwrap_or(0)
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

fn prefer_non_empty(primary: String, fallback: String) -> String {
    if primary.trim().is_empty() {
        fallback
    } else {
        primary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tour::retain_valid;
    use proptest::prelude::*;
    use quick_xml::de::from_str;

    proptest! {
        #[test]
        fn arbitrary_hotel_offers_never_survive_invalid(
            price in "[-0-9.eE ]{0,10}",
            nights in "[-0-9 ]{0,4}",
            hotelname in "[A-Za-z ]{0,6}",
            flydate in "[0-9.]{0,10}",
        ) {
            let hotel = XmlHotel {
                hotelcode: "101".into(),
                hotelname,
                countryname: "Turkey".into(),
                tours: XmlTours {
                    tours: vec![XmlTour { flydate, nights, price, ..XmlTour::default() }],
                },
                ..XmlHotel::default()
            };
            let (kept, _) = retain_valid(hotel.into_tours());
            prop_assert!(kept.iter().all(TourResult::is_valid));
        }

        #[test]
        fn arbitrary_hot_tours_never_survive_invalid(
            price in "[-0-9.eE ]{0,10}",
            nights in "[-0-9 ]{0,4}",
            hotelcode in "[0-9 ]{0,4}",
            countryname in "[A-Za-z ]{0,6}",
        ) {
            let hot = HotTour {
                hotelcode,
                hotelname: "Palm".into(),
                countryname,
                flydate: "01.07.2025".into(),
                nights,
                price,
                ..HotTour::default()
            };
            let (kept, _) = retain_valid(vec![hot.into_tour()]);
            prop_assert!(kept.iter().all(TourResult::is_valid));
        }
    }

    const RESULT_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<data>
  <status>
    <state>finished</state>
    <hotelsfound>2</hotelsfound>
    <toursfound>3</toursfound>
    <minprice>41000</minprice>
    <progress>100</progress>
    <timepassed>12</timepassed>
  </status>
  <result>
    <hotel>
      <hotelcode>101</hotelcode>
      <hotelname>Sea Breeze</hotelname>
      <hotelstars>4</hotelstars>
      <countrycode>4</countrycode>
      <countryname>Turkey</countryname>
      <regioncode>12</regioncode>
      <regionname>Antalya</regionname>
      <tours>
        <tour>
          <operatorcode>7</operatorcode>
          <operatorname>Pegas</operatorname>
          <flydate>01.07.2025</flydate>
          <nights>7</nights>
          <price>41000</price>
          <meal>AI</meal>
          <mealrussian></mealrussian>
          <currency>RUB</currency>
        </tour>
        <tour>
          <operatorcode>9</operatorcode>
          <operatorname>Anex</operatorname>
          <flydate>02.07.2025</flydate>
          <nights>10</nights>
          <price>52000</price>
          <meal>UAI</meal>
        </tour>
      </tours>
    </hotel>
    <hotel>
      <hotelcode>202</hotelcode>
      <hotelname>Palm</hotelname>
      <hotelstars>3*</hotelstars>
      <countryname>Turkey</countryname>
      <tours>
        <tour>
          <flydate>03.07.2025</flydate>
          <nights>7</nights>
          <price>0</price>
        </tour>
      </tours>
    </hotel>
  </result>
</data>"#;

    #[test]
    fn parses_result_document() {
        let envelope: XmlResultEnvelope = from_str(RESULT_XML).unwrap();
        let data = envelope.into_data();
        let status = data.status.unwrap();
        assert!(status.is_finished());
        assert_eq!(status.progress_percent(), Some(100));
        assert_eq!(status.hotels_found(), 2);

        let tours: Vec<TourResult> = data
            .result
            .unwrap()
            .hotels
            .into_iter()
            .flat_map(XmlHotel::into_tours)
            .collect();

        assert_eq!(tours.len(), 3);
        assert_eq!(tours[0].hotel_stars, 4);
        assert_eq!(tours[0].price, 41000.0);
        assert_eq!(tours[1].meal, "UAI");
        assert_eq!(tours[2].hotel_stars, 3);
        assert!(!tours[2].is_valid());
    }

    #[test]
    fn finds_request_id_in_either_place() {
        let direct: XmlSearchStart = from_str("<result><requestid>123</requestid></result>").unwrap();
        assert_eq!(direct.request_id(), Some("123"));

        let nested: XmlSearchStart =
            from_str("<data><result><requestid>456</requestid></result></data>").unwrap();
        assert_eq!(nested.request_id(), Some("456"));

        let missing: XmlSearchStart = from_str("<data><error>bad</error></data>").unwrap();
        assert_eq!(missing.request_id(), None);
    }

    #[test]
    fn hot_tours_accept_numbers_and_single_objects() {
        let body = r#"{"hottours": {"tour": {"hotelcode": 55, "hotelname": "Aqua",
            "countryname": "Egypt", "countrycode": 1, "flydate": "05.08.2025",
            "nights": 9, "price": 63000, "currency": "RUB", "hotelstars": 5}}}"#;
        let parsed: HotToursResponse = serde_json::from_str(body).unwrap();
        let tours = parsed.into_tours();
        assert_eq!(tours.len(), 1);
        assert_eq!(tours[0].hotel_code, "55");
        assert_eq!(tours[0].nights, 9);
        assert!(tours[0].is_valid());

        let bare: HotToursResponse =
            serde_json::from_str(r#"{"hottours": [{"hotelcode": "1"}, {"hotelcode": "2"}]}"#)
                .unwrap();
        assert_eq!(bare.into_tours().len(), 2);
    }

    #[test]
    fn reference_list_unwraps_nesting() {
        let body: serde_json::Value = serde_json::from_str(
            r#"{"lists": {"departures": {"departure": [{"id": 1, "name": "Moscow"}, {"id": "2", "name": "Perm"}]}}}"#,
        )
        .unwrap();
        let items = parse_reference_list(&body, "departures", "departure").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, "1");
        assert_eq!(items[1].name, "Perm");

        assert!(parse_reference_list(&body, "countries", "country").is_none());
    }
}
